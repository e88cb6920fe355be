//! Canonical message types for relay communication.
//!
//! This module defines the single source of truth for the message types
//! exchanged between the game side, the relay workers and the gateway.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::common::error::DeliveryError;
use crate::common::types::{RichText, SourceSystem, UserRef};

/// Opaque token assigned to a message when the relay ingests it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginId(String);

impl OriginId {
    /// Generate a fresh origin id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for OriginId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message as ingested by the relay.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub source: SourceSystem,
    pub author_id: String,
    pub author_display_name: String,
    pub body: RichText,
    pub timestamp: DateTime<Utc>,
    pub origin_id: OriginId,
}

impl ChatMessage {
    /// Ingest a message, assigning a new origin id.
    pub fn ingest(source: SourceSystem, author: &UserRef, body: RichText) -> Self {
        Self {
            source,
            author_id: author.id.clone(),
            author_display_name: author.display_name.clone(),
            body,
            timestamp: Utc::now(),
            origin_id: OriginId::new(),
        }
    }
}

/// A fully rendered message ready for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    /// Markdown content.
    pub content: String,
    /// Per-message author override (webhook delivery).
    pub username: Option<String>,
    /// Per-message avatar override (webhook delivery).
    pub avatar_url: Option<String>,
    pub origin_id: OriginId,
    /// Translation was requested but the provider failed.
    pub untranslated: bool,
}

impl OutboundPayload {
    pub fn new(content: impl Into<String>, origin_id: OriginId) -> Self {
        Self {
            content: content.into(),
            username: None,
            avatar_url: None,
            origin_id,
            untranslated: false,
        }
    }
}

/// An entry of the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub payload: OutboundPayload,
    pub enqueued_at: Instant,
    /// Number of send attempts made so far.
    pub attempt: u32,
}

impl OutboundItem {
    pub fn new(payload: OutboundPayload) -> Self {
        Self {
            payload,
            enqueued_at: Instant::now(),
            attempt: 0,
        }
    }
}

/// Names the gateway resolved for mention markup in an inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MentionLookup {
    pub users: Vec<UserRef>,
    /// Role id -> role name.
    pub roles: HashMap<String, String>,
    /// Channel id -> channel name.
    pub channels: HashMap<String, String>,
}

impl MentionLookup {
    pub fn user(&self, id: &str) -> Option<&UserRef> {
        self.users.iter().find(|u| u.id == id)
    }
}

/// A message received from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Gateway message id.
    pub id: String,
    pub author: UserRef,
    /// Markdown content.
    pub content: String,
    pub mentions: MentionLookup,
    /// Nonce echoed back by the gateway, if the relay sent one.
    pub nonce: Option<String>,
    /// Authored by the relay's own bot user or webhook.
    pub from_self: bool,
}

/// Observable outcome of relay work on a single message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Outbound message delivered to the gateway.
    Delivered { origin_id: OriginId, attempts: u32 },
    /// Outbound message dropped. Never silent: every drop produces one.
    DeliveryFailed {
        origin_id: OriginId,
        content: String,
        error: DeliveryError,
    },
    /// Inbound message skipped because its content could not be relayed.
    InboundSkipped { message_id: String, reason: String },
}
