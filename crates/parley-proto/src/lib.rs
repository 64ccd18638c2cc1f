//! # parley-proto
//!
//! Wire types shared by the Parley realtime transports: the tagged frames
//! exchanged with the messaging backend and the per-attempt connection
//! parameters handed to a transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod frames;
pub mod params;

pub use error::ProtoError;
pub use frames::{FrameKind, InboundFrame, OutboundFrame};
pub use params::{ConnectionParameters, CredentialKind, ResolvedCredential};
