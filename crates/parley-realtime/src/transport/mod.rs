//! Transport abstraction.
//!
//! A transport opens one connection per call and reports what happens on it
//! through a channel. The lifecycle manager never touches sockets directly.

use std::future::Future;
use std::pin::Pin;

use parley_proto::{ConnectionParameters, InboundFrame, OutboundFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

mod sse;
mod websocket;

pub use sse::{SseDecoder, SseEvent, SseTransport};
pub use websocket::WebSocketTransport;

/// Capacity of the per-connection channels.
pub const CHANNEL_CAPACITY: usize = 64;

/// Errors a transport may report when opening a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered and refused the connection.
    #[error("rejected with status {status}: {reason}")]
    Rejected {
        /// Status code returned by the server.
        status: u16,
        /// Reason returned by the server.
        reason: String,
    },

    /// Network-level failure.
    #[error("io error: {0}")]
    Io(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// `true` when the peer completed a close handshake.
    pub clean: bool,
    /// Close code, if the protocol has one.
    pub code: Option<u16>,
    /// Close reason.
    pub reason: String,
}

impl CloseInfo {
    /// A close without a handshake (reset, EOF, I/O error).
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            clean: false,
            code: None,
            reason: reason.into(),
        }
    }
}

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A tagged frame arrived.
    Frame(InboundFrame),
    /// A non-fatal problem (undecodable frame, failed send).
    Error {
        /// Code, if any.
        code: Option<u16>,
        /// Description.
        message: String,
    },
    /// The connection is gone. No further events follow.
    Closed(CloseInfo),
}

/// Everything needed to open one connection.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Backend endpoint.
    pub endpoint: Url,
    /// Freshly built parameters, including the resolved credential.
    pub params: ConnectionParameters,
    /// Cancelled when the connection must close.
    pub shutdown: CancellationToken,
}

/// An open connection.
#[derive(Debug)]
pub struct TransportConnection {
    /// Transport-assigned connection id.
    pub id: String,
    /// Frames to send.
    pub outgoing: mpsc::Sender<OutboundFrame>,
    /// Events from the connection.
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Future returned by [`Transport::open`].
pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportConnection, TransportError>> + Send + 'a>>;

/// Opens connections to the backend.
pub trait Transport: Send + Sync {
    /// Open a connection.
    ///
    /// The transport must stop its I/O and drop its channel ends once
    /// `request.shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    fn open(&self, request: OpenRequest) -> OpenFuture<'_>;
}

/// Build the endpoint URL with session query parameters appended.
pub(crate) fn session_url(endpoint: &Url, params: &ConnectionParameters) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.query_pairs() {
            query.append_pair(key, &value);
        }
    }
    url
}
