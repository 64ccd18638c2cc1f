//! Tagged frames exchanged with the messaging backend.
//!
//! Every frame is a JSON object with a `type` tag and an opaque `data`
//! payload. Payload contents are owned by the application; this crate only
//! cares about the tag.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ProtoError;

/// Known frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Chat message from a participant or agent.
    ChatMessage,
    /// Structured data message.
    DataMessage,
    /// Conversation handoff notice.
    HandoffMessage,
    /// Keepalive.
    Heartbeat,
    /// Backend reported a connection-level problem.
    ConnectionError,
    /// Backend reported a generic error.
    Error,
}

impl FrameKind {
    /// All known kinds.
    pub const ALL: [Self; 6] = [
        Self::ChatMessage,
        Self::DataMessage,
        Self::HandoffMessage,
        Self::Heartbeat,
        Self::ConnectionError,
        Self::Error,
    ];

    /// The tag used on the wire.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::DataMessage => "data_message",
            Self::HandoffMessage => "handoff_message",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionError => "connection_error",
            Self::Error => "error",
        }
    }

    /// Look up a kind by its wire tag. Accepts `-` as a separator too.
    #[must_use]
    pub fn from_wire(tag: &str) -> Option<Self> {
        let normalized = tag.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_wire().eq_ignore_ascii_case(&normalized))
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A frame received from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundFrame {
    /// Raw tag. Unknown tags are preserved so callers can log them.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Optional backend-assigned frame id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl InboundFrame {
    /// Create a frame of a known kind.
    #[must_use]
    pub fn new(kind: FrameKind, data: Value) -> Self {
        Self {
            kind: kind.as_wire().to_string(),
            data,
            id: None,
        }
    }

    /// The known kind of this frame, if any.
    #[must_use]
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_wire(&self.kind)
    }

    /// Extract `(code, message)` from an error-style payload.
    ///
    /// Accepts `{"code": 4001, "message": "..."}`, `{"message": "..."}` or a
    /// bare string payload.
    #[must_use]
    pub fn error_details(&self) -> (Option<u16>, String) {
        let code = self
            .data
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok());
        let message = match &self.data {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| other.to_string(), str::to_string),
        };
        (code, message)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a tagged frame.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let frame: Self =
            serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))?;
        if frame.kind.is_empty() {
            return Err(ProtoError::MissingField("type"));
        }
        Ok(frame)
    }
}

/// A frame sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundFrame {
    /// Frame tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
}

impl OutboundFrame {
    /// Create a frame of a known kind.
    #[must_use]
    pub fn new(kind: FrameKind, data: Value) -> Self {
        Self {
            kind: kind.as_wire().to_string(),
            data,
        }
    }

    /// A chat message with the given text.
    #[must_use]
    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(FrameKind::ChatMessage, json!({ "text": text.into() }))
    }

    /// A structured data message.
    #[must_use]
    pub fn data(payload: Value) -> Self {
        Self::new(FrameKind::DataMessage, payload)
    }

    /// A handoff request.
    #[must_use]
    pub fn handoff(payload: Value) -> Self {
        Self::new(FrameKind::HandoffMessage, payload)
    }

    /// A keepalive frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, Value::Null)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}
