//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod reconnect;
pub mod shutdown;
pub mod types;

pub use error::{ConfigError, DeliveryError, GatewayError, InboundError, SendFailure, TranslationError};
pub use messages::{
    ChatMessage, InboundMessage, MentionLookup, OriginId, OutboundItem, OutboundPayload, RelayEvent,
};
pub use types::{RichText, SourceSystem, Style, TextSegment, UserRef};
