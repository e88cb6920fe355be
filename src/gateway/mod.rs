//! Gateway capability and session management.
//!
//! The relay never talks to a gateway library directly. A [`Gateway`]
//! produces a [`Connection`]: a [`GatewaySession`] to send through and a
//! stream of [`SessionEvent`]s. The [`session::SessionManager`] drives the
//! connection lifecycle on top of that.

pub mod discord;
pub mod session;
pub mod webhook;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::error::{GatewayError, SendFailure};
use crate::common::messages::{InboundMessage, OutboundPayload};

pub use session::{GatewaySessionState, SessionHandles, SessionLink, SessionManager, SessionOptions};

/// Credentials used to open a session.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

/// Outbound rate limit advertised by a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Burst size.
    pub capacity: u32,
    /// Sustained sends per second.
    pub refill_per_sec: f64,
}

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The gateway accepted the credentials.
    Authenticated,
    /// The session can send and receive.
    Ready,
    /// A message was posted in the bridged channel.
    Message(InboundMessage),
    /// Heartbeats stopped or the socket dropped.
    ConnectivityLost,
    /// Connectivity came back on the same session.
    Resumed,
    /// The session ended and will produce no further events.
    Closed { reason: GatewayError },
}

/// An open session plus its event stream.
pub struct Connection {
    pub session: Arc<dyn GatewaySession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Open a new session.
    ///
    /// Returning `Ok` does not mean the session is usable yet: it becomes
    /// usable once [`SessionEvent::Ready`] arrives.
    async fn connect(&self, credentials: &Credentials) -> Result<Connection, GatewayError>;
}

#[async_trait]
pub trait GatewaySession: Send + Sync {
    /// Post one message to the bridged channel.
    async fn send(&self, payload: &OutboundPayload) -> Result<(), SendFailure>;

    fn rate_limit(&self) -> RateLimit;

    /// No send should start before this instant. Set when the gateway
    /// reports that its rate limit bucket is empty.
    fn not_before(&self) -> Option<tokio::time::Instant> {
        None
    }

    /// Check whether connectivity is back after [`SessionEvent::ConnectivityLost`].
    async fn resume(&self) -> Result<(), GatewayError>;

    async fn close(&self);
}
