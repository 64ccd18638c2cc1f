//! Server-sent events transport.
//!
//! Inbound traffic arrives on a long-lived `GET` with
//! `Accept: text/event-stream`. Outbound frames are `POST`ed as JSON to a
//! separate send URL when one is configured.

use futures_util::StreamExt;
use parley_proto::{InboundFrame, OutboundFrame, ProtoError};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{
    CHANNEL_CAPACITY, CloseInfo, OpenFuture, OpenRequest, Transport, TransportConnection,
    TransportError, TransportEvent, session_url,
};

/// Event name used when a block carries no `event:` field.
const DEFAULT_EVENT: &str = "message";

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name (`message` when unspecified).
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Event id, if the block carried one.
    pub id: Option<String>,
}

impl SseEvent {
    /// Convert to an inbound frame.
    ///
    /// A `message` event carries a complete JSON frame. Any other event name
    /// is the frame kind and its data is the payload; non-JSON payloads are
    /// kept as strings.
    ///
    /// # Errors
    ///
    /// Returns an error if a `message` event does not hold a valid frame.
    pub fn into_frame(self) -> Result<InboundFrame, ProtoError> {
        if self.event == DEFAULT_EVENT {
            let mut frame = InboundFrame::from_json(&self.data)?;
            if frame.id.is_none() {
                frame.id = self.id;
            }
            return Ok(frame);
        }

        let data = if self.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&self.data).unwrap_or(Value::String(self.data))
        };
        Ok(InboundFrame {
            kind: self.event,
            data,
            id: self.id,
        })
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; only complete
/// lines are interpreted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            other => trace!(field = other, "ignoring sse field"),
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id,
        })
    }
}

/// Transport reading frames from a server-sent event stream.
#[derive(Debug, Clone, Default)]
pub struct SseTransport {
    client: reqwest::Client,
    send_url: Option<Url>,
}

impl SseTransport {
    /// Create a receive-only SSE transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing HTTP client.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// `POST` outbound frames to `url`.
    #[must_use]
    pub fn with_send_url(mut self, url: Url) -> Self {
        self.send_url = Some(url);
        self
    }

    async fn open_inner(&self, request: OpenRequest) -> Result<TransportConnection, TransportError> {
        let url = session_url(&request.endpoint, &request.params);
        let (header, value) = request.params.credential.header();

        debug!(endpoint = %request.endpoint, "opening event stream");
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(header, value.clone())
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("stream rejected")
                    .to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        info!(connection_id = %id, "event stream connected");

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        let sender = Sender {
            client: self.client.clone(),
            url: self.send_url.clone(),
            header,
            value,
        };
        tokio::spawn(run_stream(
            response,
            sender,
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

impl Transport for SseTransport {
    fn open(&self, request: OpenRequest) -> OpenFuture<'_> {
        Box::pin(self.open_inner(request))
    }
}

struct Sender {
    client: reqwest::Client,
    url: Option<Url>,
    header: &'static str,
    value: String,
}

impl Sender {
    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportEvent> {
        let Some(url) = &self.url else {
            return Err(TransportEvent::Error {
                code: None,
                message: format!("no send url configured, dropped {} frame", frame.kind),
            });
        };
        let response = self
            .client
            .post(url.clone())
            .header(self.header, self.value.as_str())
            .json(frame)
            .send()
            .await
            .map_err(|e| TransportEvent::Error {
                code: None,
                message: format!("send failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportEvent::Error {
                code: Some(status.as_u16()),
                message: format!("send rejected with status {status}"),
            })
        }
    }
}

async fn run_stream(
    response: reqwest::Response,
    sender: Sender,
    mut outgoing: mpsc::Receiver<OutboundFrame>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut body = std::pin::pin!(response.bytes_stream());
    let mut decoder = SseDecoder::new();
    let mut sending = true;

    let close = loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => {
                    for sse in decoder.feed(&chunk) {
                        let event = match sse.into_frame() {
                            Ok(frame) => TransportEvent::Frame(frame),
                            Err(e) => {
                                warn!("failed to decode event: {e}");
                                TransportEvent::Error { code: None, message: e.to_string() }
                            }
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => break CloseInfo::abnormal(format!("event stream error: {e}")),
                None => break CloseInfo::abnormal("event stream ended"),
            },

            frame = outgoing.recv(), if sending => match frame {
                Some(frame) => {
                    if let Err(event) = sender.send(&frame).await {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                None => sending = false,
            },
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    debug!(reason = %close.reason, "event stream closed");
    let _ = events.send(TransportEvent::Closed(close)).await;
}
