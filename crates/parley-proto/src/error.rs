//! Error types for the parley-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a frame.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a frame.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
