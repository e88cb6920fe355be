//! Disrelay - two-way chat relay between a game server and Discord.
//!
//! The relay converts formatting between the game's styled text and
//! Discord markdown, optionally translates messages, paces outbound posts
//! through a rate-limited queue and keeps the gateway session alive across
//! outages.

pub mod bridge;
pub mod common;
pub mod config;
pub mod format;
pub mod game;
pub mod gateway;
pub mod translate;

pub use bridge::{RelayHandle, RelayRuntime};
pub use common::{RelayEvent, RichText};
pub use config::Config;
pub use game::{DisplayRequest, GameEvent};
pub use gateway::GatewaySessionState;
