//! Conversion between the game's rich text and the gateway's markdown,
//! plus message templates.

pub mod legacy;
pub mod markdown;
pub mod template;

pub use legacy::{from_legacy, strip_legacy, to_legacy};
pub use markdown::{emoji_to_shortcodes, escape_markdown, to_game_rich_text, to_gateway_markdown};
pub use template::{split_message, FormatContext, MessageFormatter, GATEWAY_MAX_MESSAGE_LEN};
