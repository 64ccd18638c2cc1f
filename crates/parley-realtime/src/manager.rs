//! Connection lifecycle manager.
//!
//! [`ConnectionManager`] drives one logical connection through its states:
//! it resolves credentials per attempt, opens the transport, supervises the
//! open connection, and reconnects with exponential backoff after abnormal
//! closures.
//!
//! Every `connect()` starts a *cycle* owned by a cancellation token. The
//! cycle's supervisor task reads transport events and runs the reconnect
//! loop. `disconnect()` and `dispose()` cancel the cycle, which aborts any
//! pending backoff sleep or in-flight open, and makes late transport events
//! inert.
//!
//! Events are emitted under a reentrant emission lock that orders them
//! against teardown, so nothing from a cancelled cycle reaches a handler
//! after `disconnect()` returns. Session bookkeeping sits behind a separate
//! lock that is never held while consumer code runs: handlers may call the
//! accessors and `dispose()` inline. State observers run inside the
//! state machine and must spawn a task for `dispose()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use parley_proto::OutboundFrame;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::{AuthProvider, Credential, resolve_credential};
use crate::config::{ConnectionTarget, RealtimeConfig};
use crate::dispatch::{EventDispatcher, EventHandlers};
use crate::error::{Error, Result};
use crate::events::{Event, EventTag};
use crate::heartbeat::{HeartbeatHandle, start_heartbeat_task};
use crate::reconnect::{Closure, ReconnectCounter, ReconnectPolicy};
use crate::state::{ConnectionState, ObserverId, StateMachine};
use crate::transport::{
    CloseInfo, OpenRequest, SseTransport, Transport, TransportConnection, TransportEvent,
    WebSocketTransport,
};

/// Reason reported when the caller disconnects.
pub const CLIENT_DISCONNECT_REASON: &str = "client requested disconnect";

/// Reason reported when the manager is disposed.
pub const DISPOSED_REASON: &str = "connection manager disposed";

/// Manages the realtime connection lifecycle.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    tenant_id: String,
    endpoint: Url,
    connection_timeout: Duration,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    auth: RwLock<AuthProvider>,
    target: RwLock<ConnectionTarget>,
    machine: StateMachine,
    dispatcher: EventDispatcher,
    attempts: ReconnectCounter,
    disposed: AtomicBool,
    emission: ReentrantMutex<()>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    cycle: Option<CancellationToken>,
    session: Option<Session>,
}

struct Session {
    id: String,
    outgoing: mpsc::Sender<OutboundFrame>,
    shutdown: CancellationToken,
    heartbeat: Option<HeartbeatHandle>,
}

impl Session {
    fn close(self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        self.shutdown.cancel();
    }
}

struct Opened {
    connection: TransportConnection,
    shutdown: CancellationToken,
    heartbeat_interval: Option<Duration>,
}

impl ConnectionManager {
    /// Create a manager over any transport.
    #[must_use]
    pub fn new(config: RealtimeConfig, transport: Arc<dyn Transport>) -> Self {
        let RealtimeConfig {
            tenant_id,
            endpoint,
            credential,
            target,
            reconnect,
            connection_timeout,
        } = config;

        Self {
            inner: Arc::new(Inner {
                tenant_id,
                endpoint,
                connection_timeout,
                policy: reconnect,
                transport,
                auth: RwLock::new(AuthProvider::new(credential)),
                target: RwLock::new(target),
                machine: StateMachine::new(),
                dispatcher: EventDispatcher::default(),
                attempts: ReconnectCounter::new(),
                disposed: AtomicBool::new(false),
                emission: ReentrantMutex::new(()),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    /// Create a manager speaking WebSocket.
    #[must_use]
    pub fn websocket(config: RealtimeConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    /// Create a manager reading a server-sent event stream.
    #[must_use]
    pub fn sse(config: RealtimeConfig, transport: SseTransport) -> Self {
        Self::new(config, Arc::new(transport))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.current()
    }

    /// Whether the connection is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Reconnection attempts made since the last successful connection.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.current()
    }

    /// Transport id of the current connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.inner
            .control
            .lock()
            .session
            .as_ref()
            .map(|session| session.id.clone())
    }

    /// Register a state observer, called with `(old, new)` on every change.
    pub fn on_state_change<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.machine.subscribe(observer)
    }

    /// Remove a state observer.
    pub fn remove_state_observer(&self, id: ObserverId) -> bool {
        self.inner.machine.unsubscribe(id)
    }

    /// Set the handler for `tag`, replacing any existing one.
    pub fn on<F>(&self, tag: EventTag, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(tag, handler);
    }

    /// Merge `partial` into the handler table.
    pub fn update_event_handlers(&self, partial: EventHandlers) {
        self.inner.dispatcher.update_handlers(partial);
    }

    /// Open the connection.
    ///
    /// Returns immediately when a cycle is already active (`Connecting`,
    /// `Connected` or `Reconnecting`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after [`dispose`](Self::dispose),
    /// [`Error::AuthResolution`] if the credential cannot be resolved,
    /// [`Error::Connection`] if the transport fails, [`Error::Timeout`] if
    /// credential resolution and the open together exceed the timeout, and
    /// [`Error::Cancelled`] if a disconnect wins the race.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let cycle = {
            let _emission = inner.emission.lock();
            if inner.is_disposed() {
                return Err(Error::Disposed);
            }
            let state = inner.machine.current();
            if state.is_active() {
                debug!(%state, "connect ignored, cycle already active");
                return Ok(());
            }
            if !inner.transition(ConnectionState::Connecting) {
                return Err(Error::Connection {
                    status: None,
                    reason: format!("cannot connect while {state}"),
                });
            }
            inner.attempts.reset();
            let cycle = CancellationToken::new();
            inner.control.lock().cycle = Some(cycle.clone());
            cycle
        };

        info!(tenant = %inner.tenant_id, endpoint = %inner.endpoint, "connecting");
        let result = inner.open(&cycle).await;

        let emission = inner.emission.lock();
        if cycle.is_cancelled() {
            if let Ok(opened) = &result {
                opened.shutdown.cancel();
            }
            debug!("connect attempt superseded");
            return Err(if inner.is_disposed() {
                Error::Disposed
            } else {
                Error::Cancelled
            });
        }

        match result {
            Ok(opened) => {
                inner.transition(ConnectionState::Connected);
                inner.attempts.reset();
                let incoming = inner.install(opened);
                inner.emit(&Event::Connected);
                drop(emission);
                tokio::spawn(supervise(Arc::clone(inner), cycle, incoming));
                Ok(())
            }
            Err(e) => {
                warn!(tenant = %inner.tenant_id, error = %e, "connect failed");
                inner.control.lock().cycle = None;
                inner.transition(ConnectionState::Disconnected);
                inner.emit(&Event::ConnectionError {
                    code: e.status(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Close the connection and cancel any pending reconnection.
    ///
    /// Does nothing when already `Disconnected`.
    pub async fn disconnect(&self) {
        self.inner.teardown(CLIENT_DISCONNECT_REASON);
    }

    /// Permanently deactivate the manager.
    ///
    /// Tears down the connection, cancels pending work, and clears handlers
    /// and observers. Later `connect()` calls fail with [`Error::Disposed`].
    /// Calling it again does nothing.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.teardown(DISPOSED_REASON);
        inner.dispatcher.clear();
        inner.machine.clear_observers();
        info!(tenant = %inner.tenant_id, "connection manager disposed");
    }

    /// Replace the credential.
    ///
    /// When connected, runs exactly one disconnect/connect cycle so the new
    /// credential takes effect; otherwise the next attempt picks it up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after disposal, or the error of the
    /// reconnect.
    pub async fn update_credential(&self, credential: Credential) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        info!(source = credential.source_name(), "credential updated");
        self.inner.auth.write().set(credential);
        self.cycle_if_connected().await
    }

    /// Replace the connection target, reconnecting when connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid target,
    /// [`Error::Disposed`] after disposal, or the error of the reconnect.
    pub async fn update_target(&self, target: ConnectionTarget) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        target.validate()?;
        info!(workflow = %target.workflow_id, participant = %target.participant_id, "target updated");
        *self.inner.target.write() = target;
        self.cycle_if_connected().await
    }

    async fn cycle_if_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.disconnect().await;
        self.connect().await
    }

    /// Send a frame on the open connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the state is `Connected`, and
    /// [`Error::Connection`] if the connection closes before the frame is
    /// queued.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let outgoing = {
            let control = self.inner.control.lock();
            let state = self.inner.machine.current();
            match (&control.session, state) {
                (Some(session), ConnectionState::Connected) => session.outgoing.clone(),
                _ => return Err(Error::NotConnected(state)),
            }
        };
        outgoing.send(frame).await.map_err(|_| Error::Connection {
            status: None,
            reason: "connection closed before the frame was sent".to_string(),
        })
    }

    /// Send a chat message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(OutboundFrame::chat(text)).await
    }

    /// Send a data message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_data(&self, payload: Value) -> Result<()> {
        self.send(OutboundFrame::data(payload)).await
    }

    /// Send a handoff message.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_handoff(&self, payload: Value) -> Result<()> {
        self.send(OutboundFrame::handoff(payload)).await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("tenant_id", &self.inner.tenant_id)
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn transition(&self, to: ConnectionState) -> bool {
        match self.machine.transition(to) {
            Some(transition) => {
                self.emit(&Event::StateChanged {
                    old: transition.old,
                    new: transition.new,
                });
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: &Event) {
        self.dispatcher.dispatch(event);
    }

    fn closure(&self, cycle: &CancellationToken) -> Closure {
        Closure {
            disposed: self.is_disposed(),
            caller_initiated: cycle.is_cancelled(),
        }
    }

    /// Resolve the credential and open one connection, bounded by the
    /// connection timeout and abandoned when `cycle` is cancelled.
    async fn open(&self, cycle: &CancellationToken) -> Result<Opened> {
        let shutdown = cycle.child_token();
        let attempt = async {
            let credential = self.auth.read().credential().clone();
            let resolved = resolve_credential(&credential).await?;
            let params = self.target.read().parameters(&self.tenant_id, resolved);
            let heartbeat_interval = params.heartbeat_interval;
            let request = OpenRequest {
                endpoint: self.endpoint.clone(),
                params,
                shutdown: shutdown.clone(),
            };
            let connection = self.transport.open(request).await?;
            Ok::<_, Error>(Opened {
                connection,
                shutdown: shutdown.clone(),
                heartbeat_interval,
            })
        };

        let result = tokio::select! {
            biased;
            () = cycle.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.connection_timeout, attempt) => {
                result.unwrap_or(Err(Error::Timeout(self.connection_timeout)))
            }
        };
        if result.is_err() {
            shutdown.cancel();
        }
        result
    }

    /// Store the session and start its heartbeat; returns the event stream.
    fn install(&self, opened: Opened) -> mpsc::Receiver<TransportEvent> {
        let Opened {
            connection,
            shutdown,
            heartbeat_interval,
        } = opened;

        let heartbeat = heartbeat_interval.map(|interval| {
            start_heartbeat_task(connection.outgoing.clone(), interval, shutdown.child_token())
        });
        info!(connection_id = %connection.id, "connected");

        let previous = self.control.lock().session.replace(Session {
            id: connection.id,
            outgoing: connection.outgoing,
            shutdown,
            heartbeat,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        connection.incoming
    }

    fn teardown(&self, reason: &str) {
        let _emission = self.emission.lock();
        let (cycle, session) = {
            let mut control = self.control.lock();
            (control.cycle.take(), control.session.take())
        };
        if let Some(cycle) = cycle {
            cycle.cancel();
        }
        if let Some(session) = session {
            session.close();
        }

        match self.machine.current() {
            ConnectionState::Disconnected => {}
            ConnectionState::Failed => {
                self.transition(ConnectionState::Disconnected);
            }
            state => {
                info!(%state, reason, "disconnecting");
                self.transition(ConnectionState::Disconnecting);
                // A handler may already have finished the teardown inline.
                if self.transition(ConnectionState::Disconnected) {
                    self.emit(&Event::Disconnected {
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    /// Forward transport events until the connection closes. Returns `None`
    /// once the cycle is cancelled.
    async fn pump(
        &self,
        cycle: &CancellationToken,
        incoming: &mut mpsc::Receiver<TransportEvent>,
    ) -> Option<CloseInfo> {
        loop {
            let received = tokio::select! {
                biased;
                () = cycle.cancelled() => return None,
                received = incoming.recv() => received,
            };

            let event = match received {
                Some(TransportEvent::Frame(frame)) => {
                    let kind = frame.kind.clone();
                    let Some(event) = Event::from_frame(frame) else {
                        debug!(%kind, "ignoring frame of unknown kind");
                        continue;
                    };
                    event
                }
                Some(TransportEvent::Error { code, message }) => {
                    Event::ConnectionError { code, message }
                }
                Some(TransportEvent::Closed(close)) => return Some(close),
                None => return Some(CloseInfo::abnormal("transport dropped the connection")),
            };

            let _emission = self.emission.lock();
            if cycle.is_cancelled() {
                return None;
            }
            self.emit(&event);
        }
    }

    /// React to a closure: settle in `Disconnected`, or retry with backoff
    /// until a connection opens (returning its events) or attempts run out.
    async fn recover(
        &self,
        cycle: &CancellationToken,
        close: CloseInfo,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let reason = close.reason;
        {
            let _emission = self.emission.lock();
            if cycle.is_cancelled() {
                return None;
            }
            let session = self.control.lock().session.take();
            if let Some(session) = session {
                session.close();
            }
            if !self.policy.should_retry(0, self.closure(cycle)) {
                info!(%reason, clean = close.clean, "connection closed, not reconnecting");
                self.control.lock().cycle = None;
                self.transition(ConnectionState::Disconnected);
                self.emit(&Event::Disconnected { reason });
                return None;
            }
            warn!(%reason, clean = close.clean, code = ?close.code, "connection lost");
            self.transition(ConnectionState::Reconnecting);
        }

        loop {
            let attempt = self.attempts.increment();
            let delay = self.policy.next_delay(attempt);
            {
                let _emission = self.emission.lock();
                if cycle.is_cancelled() {
                    return None;
                }
                self.emit(&Event::Reconnecting {
                    attempt,
                    delay,
                    reason: reason.clone(),
                });
            }
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

            tokio::select! {
                biased;
                () = cycle.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let result = self.open(cycle).await;
            let _emission = self.emission.lock();
            if cycle.is_cancelled() {
                if let Ok(opened) = &result {
                    opened.shutdown.cancel();
                }
                return None;
            }

            match result {
                Ok(opened) => {
                    let connection_id = opened.connection.id.clone();
                    self.transition(ConnectionState::Connected);
                    self.attempts.reset();
                    let incoming = self.install(opened);
                    info!(%connection_id, attempt, "reconnected");
                    self.emit(&Event::Reconnected { connection_id });
                    return Some(incoming);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    self.emit(&Event::ConnectionError {
                        code: e.status(),
                        message: e.to_string(),
                    });
                    if !self.policy.should_retry(attempt, self.closure(cycle)) {
                        error!(attempts = attempt, "giving up on reconnection");
                        self.control.lock().cycle = None;
                        self.transition(ConnectionState::Failed);
                        self.emit(&Event::Error {
                            message: format!(
                                "reconnection failed after {attempt} attempts: {e}"
                            ),
                        });
                        return None;
                    }
                }
            }
        }
    }
}

/// Supervisor for one connect cycle.
async fn supervise(
    inner: Arc<Inner>,
    cycle: CancellationToken,
    mut incoming: mpsc::Receiver<TransportEvent>,
) {
    loop {
        let Some(close) = inner.pump(&cycle, &mut incoming).await else {
            break;
        };
        match inner.recover(&cycle, close).await {
            Some(next) => incoming = next,
            None => break,
        }
    }
    debug!("connection supervisor finished");
}
