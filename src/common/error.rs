//! Error types for the application.

use std::time::Duration;

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Session-level gateway failures. These drive the session state machine
/// and are retried automatically.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Authentication failed: {reason}")]
    AuthenticationFailure { reason: String },

    #[error("Network error: {message}")]
    TransientNetwork { message: String },

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Gateway closed the session")]
    Closed,
}

/// Result of a single failed send, as classified by the gateway.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendFailure {
    /// Network error or temporary unavailability. Retried.
    #[error("Transient send failure: {message}")]
    TransientNetwork {
        message: String,
        /// Delay requested by the gateway (rate limited responses).
        retry_after: Option<Duration>,
    },

    /// The gateway rejected the message. Never retried.
    #[error("Message rejected: {reason}")]
    PermanentDelivery { reason: String },
}

impl SendFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentDelivery {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientNetwork { retry_after, .. } => *retry_after,
            Self::PermanentDelivery { .. } => None,
        }
    }
}

/// Why an outbound message was not delivered.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    #[error("Outbound queue full, oldest message dropped")]
    QueueOverflow,

    #[error("Message rejected by gateway: {reason}")]
    PermanentDelivery { reason: String },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Relay shut down before the message was sent")]
    ShutDown,
}

/// Translation capability failures. Never surfaced to users: the relay
/// falls back to the untranslated text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranslationError {
    #[error("Translation unavailable: {message}")]
    TranslationUnavailable { message: String },

    #[error("Translation timed out")]
    Timeout,
}

/// Problems with a single inbound gateway message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InboundError {
    #[error("Malformed inbound content: {reason}")]
    MalformedInboundContent { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failure_classification() {
        let transient = SendFailure::TransientNetwork {
            message: "reset".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(transient.is_transient());
        assert_eq!(transient.retry_after(), Some(Duration::from_secs(2)));

        let permanent = SendFailure::permanent("too long");
        assert!(!permanent.is_transient());
        assert_eq!(permanent.retry_after(), None);
    }

    #[test]
    fn test_delivery_error_display() {
        let error = DeliveryError::RetriesExhausted {
            attempts: 5,
            last_error: "timeout".to_string(),
        };
        assert_eq!(error.to_string(), "Gave up after 5 attempts: timeout");
    }
}
