//! WebSocket hub transport.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_proto::{InboundFrame, OutboundFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CHANNEL_CAPACITY, CloseInfo, OpenFuture, OpenRequest, Transport, TransportConnection,
    TransportError, TransportEvent, session_url,
};

/// Transport speaking JSON text frames over a WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    _private: (),
}

impl WebSocketTransport {
    /// Create a WebSocket transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn open_inner(request: OpenRequest) -> Result<TransportConnection, TransportError> {
        let url = session_url(&request.endpoint, &request.params);
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let (header, value) = request.params.credential.header();
        let value = HeaderValue::from_str(&value)
            .map_err(|e| TransportError::InvalidRequest(format!("invalid credential header: {e}")))?;
        ws_request.headers_mut().insert(header, value);

        debug!(endpoint = %request.endpoint, "opening websocket");
        let (ws_stream, _) = connect_async(ws_request).await.map_err(map_connect_error)?;

        let id = Uuid::new_v4().to_string();
        info!(connection_id = %id, "websocket connected");

        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        tokio::spawn(run_connection(
            read,
            write,
            outgoing_rx,
            events_tx,
            request.shutdown,
        ));

        Ok(TransportConnection {
            id,
            outgoing: outgoing_tx,
            incoming: events_rx,
        })
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, request: OpenRequest) -> OpenFuture<'_> {
        Box::pin(Self::open_inner(request))
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            TransportError::Rejected {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("upgrade rejected")
                    .to_string(),
            }
        }
        other => TransportError::Io(other.to_string()),
    }
}

/// Pump frames in both directions until the socket closes or `shutdown`
/// fires. Emits exactly one `Closed` unless shut down locally.
async fn run_connection<R, W>(
    mut read: R,
    mut write: W,
    mut outgoing: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut sending = true;
    let close = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!("close frame not delivered: {e}");
                }
                return;
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event = match InboundFrame::from_json(&text) {
                        Ok(frame) => TransportEvent::Frame(frame),
                        Err(e) => {
                            warn!("failed to decode frame: {e}");
                            TransportEvent::Error { code: None, message: e.to_string() }
                        }
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        break CloseInfo::abnormal(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseInfo {
                            clean: true,
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_string(),
                        },
                        None => CloseInfo { clean: true, code: None, reason: "server closed connection".to_string() },
                    };
                }
                Some(Ok(_)) => {
                    // Binary, Pong and raw frames carry nothing for us.
                }
                Some(Err(e)) => break CloseInfo::abnormal(format!("websocket error: {e}")),
                None => break CloseInfo::abnormal("connection closed"),
            },

            frame = outgoing.recv(), if sending => match frame {
                Some(frame) => match frame.to_json() {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            break CloseInfo::abnormal(format!("write failed: {e}"));
                        }
                    }
                    Err(e) => {
                        let _ = events
                            .send(TransportEvent::Error { code: None, message: e.to_string() })
                            .await;
                    }
                },
                None => sending = false,
            },
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    debug!(clean = close.clean, reason = %close.reason, "websocket closed");
    let _ = events.send(TransportEvent::Closed(close)).await;
}
