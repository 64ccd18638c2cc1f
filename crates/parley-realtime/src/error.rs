//! Error types for parley-realtime.

use std::time::Duration;

use thiserror::Error;

use crate::events::EventTag;
use crate::state::ConnectionState;
use crate::transport::TransportError;

/// Errors that can occur in realtime client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or conflicting configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The credential could not be resolved.
    #[error("auth resolution failed: {0}")]
    AuthResolution(String),

    /// The transport rejected or failed the connection.
    #[error("connection failed: {reason}")]
    Connection {
        /// Status reported by the transport, if any.
        status: Option<u16>,
        /// Human-readable reason.
        reason: String,
    },

    /// Opening the connection exceeded the configured timeout.
    #[error("connection timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A domain operation was attempted while not connected.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// The manager has been disposed.
    #[error("connection manager disposed")]
    Disposed,

    /// The attempt was abandoned because a disconnect or dispose won the race.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// A consumer-supplied handler panicked.
    #[error("handler for {tag} failed: {message}")]
    HandlerExecution {
        /// Tag whose handler failed.
        tag: EventTag,
        /// Panic message.
        message: String,
    },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] parley_proto::ProtoError),
}

impl Error {
    /// Status code attached to a connection error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Connection { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { status, reason } => Self::Connection {
                status: Some(status),
                reason,
            },
            other => Self::Connection {
                status: None,
                reason: other.to_string(),
            },
        }
    }
}

/// Result alias for realtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = Error::Configuration("tenant_id is required".to_string());
        assert_eq!(err.to_string(), "configuration error: tenant_id is required");
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout(Duration::from_millis(30_000));
        assert_eq!(err.to_string(), "connection timed out after 30000ms");
    }

    #[test]
    fn test_not_connected_display() {
        let err = Error::NotConnected(ConnectionState::Reconnecting);
        assert_eq!(err.to_string(), "not connected (state: reconnecting)");
    }

    #[test]
    fn test_handler_execution_display() {
        let err = Error::HandlerExecution {
            tag: EventTag::ChatMessage,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "handler for chat_message failed: boom");
    }

    #[test]
    fn test_rejected_transport_error_keeps_status() {
        let err: Error = TransportError::Rejected {
            status: 401,
            reason: "unauthorized".to_string(),
        }
        .into();
        assert_eq!(err.status(), Some(401));
        assert!(err.to_string().contains("unauthorized"));
    }

    #[test]
    fn test_io_transport_error_has_no_status() {
        let err: Error = TransportError::Io("connection refused".to_string()).into();
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_proto_error_conversion() {
        let err: Error = parley_proto::ProtoError::MissingField("type").into();
        assert!(err.to_string().contains("protocol error"));
    }
}
