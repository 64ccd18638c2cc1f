//! Test helpers for lifecycle tests: a scripted transport and event recorders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use parley_proto::{ConnectionParameters, InboundFrame, OutboundFrame};
use parley_realtime::transport::{CHANNEL_CAPACITY, OpenFuture};
use parley_realtime::{
    CloseInfo, ConnectionManager, ConnectionState, Event, EventTag, OpenRequest, RealtimeConfig,
    RealtimeConfigBuilder, Transport, TransportConnection, TransportError, TransportEvent,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Every tag a consumer can subscribe to.
pub const ALL_TAGS: [EventTag; 11] = [
    EventTag::Connected,
    EventTag::Disconnected,
    EventTag::Reconnecting,
    EventTag::Reconnected,
    EventTag::ConnectionError,
    EventTag::Error,
    EventTag::StateChanged,
    EventTag::ChatMessage,
    EventTag::DataMessage,
    EventTag::HandoffMessage,
    EventTag::Heartbeat,
];

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder preloaded with valid required fields and an API key.
pub fn builder() -> RealtimeConfigBuilder {
    RealtimeConfig::builder()
        .tenant_id("acme")
        .endpoint("wss://realtime.example.com/hub")
        .workflow("wf-1")
        .participant("p-1")
}

/// Config with an API key and the given reconnect settings.
pub fn config(max_attempts: u32, base_delay_ms: u64) -> RealtimeConfig {
    builder()
        .api_key("key-1")
        .reconnect_max_attempts(max_attempts)
        .reconnect_base_delay(Duration::from_millis(base_delay_ms))
        .build()
        .expect("valid config")
}

/// What the mock does on the next `open`.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Open succeeds.
    Accept,
    /// Server refuses with a status.
    Reject(u16),
    /// Network failure.
    Fail,
    /// Succeeds after a delay.
    Delay(Duration),
    /// Never completes.
    Hang,
}

/// One recorded `open` call.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub at: Instant,
    pub params: ConnectionParameters,
}

struct Link {
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

/// Transport whose outcomes are scripted per call. Unscripted calls accept.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Behavior>>,
    opens: Mutex<Vec<OpenRecord>>,
    links: Mutex<Vec<Link>>,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    next_id: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.script.lock().extend(behaviors);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.opens.lock().clone()
    }

    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.sent.lock().clone()
    }

    /// Whether every accepted connection has been told to shut down.
    pub fn all_shut_down(&self) -> bool {
        self.links.lock().iter().all(|link| link.shutdown.is_cancelled())
    }

    fn latest_events(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.links.lock().last().map(|link| link.events.clone())
    }

    /// Report an abnormal closure on the latest connection.
    pub async fn drop_connection(&self) {
        self.close(CloseInfo::abnormal("connection reset")).await;
    }

    /// Report a closure on the latest connection.
    pub async fn close(&self, close: CloseInfo) {
        if let Some(events) = self.latest_events() {
            let _ = events.send(TransportEvent::Closed(close)).await;
        }
    }

    /// Deliver a frame on the latest connection.
    pub async fn deliver(&self, frame: InboundFrame) {
        if let Some(events) = self.latest_events() {
            let _ = events.send(TransportEvent::Frame(frame)).await;
        }
    }

    /// Report a non-fatal transport error on the latest connection.
    pub async fn report_error(&self, code: Option<u16>, message: &str) {
        if let Some(events) = self.latest_events() {
            let _ = events
                .send(TransportEvent::Error {
                    code,
                    message: message.to_string(),
                })
                .await;
        }
    }

    fn accept(&self, shutdown: CancellationToken) -> TransportConnection {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutboundFrame>(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let sent = Arc::clone(&self.sent);
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    frame = outgoing_rx.recv() => match frame {
                        Some(frame) => sent.lock().push(frame),
                        None => break,
                    },
                }
            }
        });

        self.links.lock().push(Link {
            events: events_tx,
            shutdown,
        });
        TransportConnection {
            id: format!("mock-{n}"),
            outgoing: outgoing_tx,
            incoming: events_rx,
        }
    }
}

impl Transport for MockTransport {
    fn open(&self, request: OpenRequest) -> OpenFuture<'_> {
        Box::pin(async move {
            let behavior = self.script.lock().pop_front().unwrap_or(Behavior::Accept);
            self.opens.lock().push(OpenRecord {
                at: Instant::now(),
                params: request.params.clone(),
            });

            match behavior {
                Behavior::Accept => Ok(self.accept(request.shutdown)),
                Behavior::Reject(status) => Err(TransportError::Rejected {
                    status,
                    reason: "rejected by mock".to_string(),
                }),
                Behavior::Fail => Err(TransportError::Io("connection refused".to_string())),
                Behavior::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(self.accept(request.shutdown))
                }
                Behavior::Hang => {
                    std::future::pending::<Result<TransportConnection, TransportError>>().await
                }
            }
        })
    }
}

/// Records every dispatched event.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let log = Self::default();
        for tag in ALL_TAGS {
            manager.on(tag, log.recorder());
        }
        log
    }

    /// A handler appending to this log.
    pub fn recorder(&self) -> impl Fn(&Event) + Send + Sync + 'static {
        let sink = self.clone();
        move |event| sink.0.lock().push(event.clone())
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn of(&self, tag: EventTag) -> Vec<Event> {
        self.0
            .lock()
            .iter()
            .filter(|event| event.tag() == tag)
            .cloned()
            .collect()
    }

    pub fn count(&self, tag: EventTag) -> usize {
        self.of(tag).len()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Records every state transition seen by an observer.
#[derive(Clone, Default)]
pub struct TransitionLog(Arc<Mutex<Vec<(ConnectionState, ConnectionState)>>>);

impl TransitionLog {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let log = Self::default();
        let sink = log.clone();
        manager.on_state_change(move |old, new| sink.0.lock().push((old, new)));
        log
    }

    pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Let spawned tasks run without advancing paused time meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Assert two durations are within 10ms of each other.
pub fn assert_near(actual: Duration, expected: Duration) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= Duration::from_millis(10),
        "expected ~{expected:?}, got {actual:?}"
    );
}
