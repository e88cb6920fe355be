//! Game side of the relay.
//!
//! The game hands the relay [`GameEvent`]s and drains [`DisplayRequest`]s.
//! `console` is a stand-in game that reads events from stdin.

pub mod console;

use crate::common::types::{RichText, UserRef};

/// Something that happened in game.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// A player sent a chat line.
    Chat { author: UserRef, body: RichText },
    Joined { player: UserRef },
    Left { player: UserRef },
    /// `message` is the full death message as the game printed it.
    Death { player: UserRef, message: String },
    Advancement {
        player: UserRef,
        title: String,
        frame: AdvancementFrame,
    },
}

impl GameEvent {
    pub fn chat(author: impl Into<String>, body: RichText) -> Self {
        Self::Chat {
            author: UserRef::player(author),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancementFrame {
    Task,
    Goal,
    Challenge,
}

impl AdvancementFrame {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "goal" => Some(Self::Goal),
            "challenge" => Some(Self::Challenge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    /// A message relayed from the gateway.
    Relayed,
    /// A notice from the relay itself, such as a failed delivery.
    SystemNotice,
}

/// A line the game should show to players.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRequest {
    pub text: RichText,
    pub kind: DisplayKind,
    /// Translation was requested but the provider failed.
    pub untranslated: bool,
}
