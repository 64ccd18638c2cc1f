//! Events delivered to consumer callbacks.

use std::fmt;
use std::time::Duration;

use parley_proto::{FrameKind, InboundFrame};
use serde_json::Value;

use crate::state::ConnectionState;

/// Tag identifying a handler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    /// Connection established by `connect()`.
    Connected,
    /// Connection closed for good.
    Disconnected,
    /// A reconnection attempt is scheduled.
    Reconnecting,
    /// A reconnection attempt succeeded.
    Reconnected,
    /// Connection-level error.
    ConnectionError,
    /// Generic error channel.
    Error,
    /// Lifecycle state changed.
    StateChanged,
    /// Chat message from the backend.
    ChatMessage,
    /// Data message from the backend.
    DataMessage,
    /// Handoff message from the backend.
    HandoffMessage,
    /// Heartbeat from the backend.
    Heartbeat,
}

impl EventTag {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::ConnectionError => "connection_error",
            Self::Error => "error",
            Self::StateChanged => "state_changed",
            Self::ChatMessage => "chat_message",
            Self::DataMessage => "data_message",
            Self::HandoffMessage => "handoff_message",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connection established.
    Connected,
    /// Connection lost or closed.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Attempting reconnection.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
        /// Why the previous connection ended.
        reason: String,
    },
    /// Reconnected after a drop.
    Reconnected {
        /// Transport connection id.
        connection_id: String,
    },
    /// Connection-level error.
    ConnectionError {
        /// Status or close code, if any.
        code: Option<u16>,
        /// Error message.
        message: String,
    },
    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
    /// Lifecycle state changed.
    StateChanged {
        /// Previous state.
        old: ConnectionState,
        /// New state.
        new: ConnectionState,
    },
    /// Chat message payload.
    ChatMessage(Value),
    /// Data message payload.
    DataMessage(Value),
    /// Handoff message payload.
    HandoffMessage(Value),
    /// Heartbeat payload.
    Heartbeat(Value),
}

impl Event {
    /// The handler slot this event is routed to.
    #[must_use]
    pub const fn tag(&self) -> EventTag {
        match self {
            Self::Connected => EventTag::Connected,
            Self::Disconnected { .. } => EventTag::Disconnected,
            Self::Reconnecting { .. } => EventTag::Reconnecting,
            Self::Reconnected { .. } => EventTag::Reconnected,
            Self::ConnectionError { .. } => EventTag::ConnectionError,
            Self::Error { .. } => EventTag::Error,
            Self::StateChanged { .. } => EventTag::StateChanged,
            Self::ChatMessage(_) => EventTag::ChatMessage,
            Self::DataMessage(_) => EventTag::DataMessage,
            Self::HandoffMessage(_) => EventTag::HandoffMessage,
            Self::Heartbeat(_) => EventTag::Heartbeat,
        }
    }

    /// Convert an inbound frame. Unknown frame kinds yield `None`.
    #[must_use]
    pub fn from_frame(frame: InboundFrame) -> Option<Self> {
        let event = match frame.frame_kind()? {
            FrameKind::ChatMessage => Self::ChatMessage(frame.data),
            FrameKind::DataMessage => Self::DataMessage(frame.data),
            FrameKind::HandoffMessage => Self::HandoffMessage(frame.data),
            FrameKind::Heartbeat => Self::Heartbeat(frame.data),
            FrameKind::ConnectionError => {
                let (code, message) = frame.error_details();
                Self::ConnectionError { code, message }
            }
            FrameKind::Error => Self::Error {
                message: frame.error_details().1,
            },
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tags() {
        assert_eq!(Event::Connected.tag(), EventTag::Connected);
        assert_eq!(
            Event::Disconnected {
                reason: "timeout".to_string()
            }
            .tag(),
            EventTag::Disconnected
        );
        assert_eq!(
            Event::StateChanged {
                old: ConnectionState::Connecting,
                new: ConnectionState::Connected,
            }
            .tag(),
            EventTag::StateChanged
        );
        assert_eq!(Event::Heartbeat(Value::Null).tag(), EventTag::Heartbeat);
    }

    #[test]
    fn test_from_chat_frame() {
        let frame = InboundFrame::new(FrameKind::ChatMessage, json!({ "text": "hi" }));
        let event = Event::from_frame(frame).expect("known kind");
        assert_eq!(event, Event::ChatMessage(json!({ "text": "hi" })));
    }

    #[test]
    fn test_from_connection_error_frame() {
        let frame = InboundFrame::new(
            FrameKind::ConnectionError,
            json!({ "code": 4403, "message": "forbidden" }),
        );
        let event = Event::from_frame(frame).expect("known kind");
        assert_eq!(
            event,
            Event::ConnectionError {
                code: Some(4403),
                message: "forbidden".to_string()
            }
        );
    }

    #[test]
    fn test_from_error_frame() {
        let frame = InboundFrame::new(FrameKind::Error, json!({ "message": "bad request" }));
        let event = Event::from_frame(frame).expect("known kind");
        assert_eq!(
            event,
            Event::Error {
                message: "bad request".to_string()
            }
        );
    }

    #[test]
    fn test_from_unknown_frame() {
        let frame = InboundFrame {
            kind: "presence".to_string(),
            data: Value::Null,
            id: None,
        };
        assert!(Event::from_frame(frame).is_none());
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(EventTag::HandoffMessage.to_string(), "handoff_message");
        assert_eq!(EventTag::ConnectionError.to_string(), "connection_error");
    }
}
