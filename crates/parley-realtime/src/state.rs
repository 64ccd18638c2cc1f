//! Connection state and the state machine guarding its transitions.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// State of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected.
    Connected,
    /// Closing at the caller's request.
    Disconnecting,
    /// Connection dropped, retrying.
    Reconnecting,
    /// Permanently failed (max retries exceeded).
    Failed,
}

impl ConnectionState {
    /// All states.
    pub const ALL: [Self; 6] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::Disconnecting,
        Self::Reconnecting,
        Self::Failed,
    ];

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, Disconnecting, Failed, Reconnecting,
        };
        matches!(
            (self, to),
            (Disconnected | Failed, Connecting)
                | (Failed, Disconnected)
                | (Connecting, Connected | Disconnected | Disconnecting | Reconnecting)
                | (Connected, Disconnecting | Reconnecting | Disconnected)
                | (Reconnecting, Connected | Failed | Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Whether a connect cycle is in progress or established.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the change.
    pub old: ConnectionState,
    /// State after the change.
    pub new: ConnectionState,
}

/// Identifies a registered state observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Holds the current state, rejects illegal transitions and notifies
/// observers synchronously in registration order.
pub struct StateMachine {
    state: Mutex<ConnectionState>,
    // Serializes set-and-notify so observers see transitions in record order.
    notify: Mutex<()>,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    next_id: AtomicU64,
}

impl StateMachine {
    /// Create a state machine starting in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            notify: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `to`.
    ///
    /// Returns the recorded transition, or `None` when the move is illegal
    /// (including `old == new`); illegal moves leave the state untouched.
    pub fn transition(&self, to: ConnectionState) -> Option<Transition> {
        let _order = self.notify.lock();
        let transition = {
            let mut state = self.state.lock();
            let old = *state;
            if !old.can_transition_to(to) {
                warn!(from = %old, to = %to, "rejected illegal state transition");
                return None;
            }
            *state = to;
            Transition { old, new: to }
        };
        debug!(from = %transition.old, to = %transition.new, "connection state changed");
        self.notify_observers(transition);
        Some(transition)
    }

    /// Register an observer. Observers run inline on the task that raised
    /// the transition.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Drop every observer.
    pub fn clear_observers(&self) {
        self.observers.write().clear();
    }

    fn notify_observers(&self, transition: Transition) {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer(transition.old, transition.new);
            }));
            if outcome.is_err() {
                error!(
                    from = %transition.old,
                    to = %transition.new,
                    "state observer panicked"
                );
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_starts_disconnected() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), ConnectionState::Disconnected);
    }

    #[test_case(ConnectionState::Disconnected, ConnectionState::Connecting, true ; "connect")]
    #[test_case(ConnectionState::Connecting, ConnectionState::Connected, true ; "open succeeded")]
    #[test_case(ConnectionState::Connected, ConnectionState::Reconnecting, true ; "dropped")]
    #[test_case(ConnectionState::Reconnecting, ConnectionState::Failed, true ; "exhausted")]
    #[test_case(ConnectionState::Failed, ConnectionState::Connecting, true ; "restart after failure")]
    #[test_case(ConnectionState::Disconnecting, ConnectionState::Disconnected, true ; "closed")]
    #[test_case(ConnectionState::Disconnected, ConnectionState::Connected, false ; "skip connecting")]
    #[test_case(ConnectionState::Connected, ConnectionState::Connected, false ; "self loop")]
    #[test_case(ConnectionState::Reconnecting, ConnectionState::Reconnecting, false ; "reconnect self loop")]
    #[test_case(ConnectionState::Disconnecting, ConnectionState::Connected, false ; "reopen while closing")]
    #[test_case(ConnectionState::Failed, ConnectionState::Connected, false ; "failed to connected")]
    fn test_transition_table(from: ConnectionState, to: ConnectionState, legal: bool) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let machine = StateMachine::new();
        assert!(machine.transition(ConnectionState::Connected).is_none());
        assert_eq!(machine.current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_observers_receive_old_and_new_in_order() {
        let machine = StateMachine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        machine.subscribe(move |old, new| first.lock().push(("first", old, new)));
        let second = Arc::clone(&seen);
        machine.subscribe(move |old, new| second.lock().push(("second", old, new)));

        machine.transition(ConnectionState::Connecting);

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("first", ConnectionState::Disconnected, ConnectionState::Connecting),
                ("second", ConnectionState::Disconnected, ConnectionState::Connecting),
            ]
        );
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let machine = StateMachine::new();
        let reached = Arc::new(Mutex::new(false));

        machine.subscribe(|_, _| panic!("observer bug"));
        let flag = Arc::clone(&reached);
        machine.subscribe(move |_, _| *flag.lock() = true);

        let transition = machine.transition(ConnectionState::Connecting);

        assert!(transition.is_some());
        assert!(*reached.lock());
        assert_eq!(machine.current(), ConnectionState::Connecting);
    }

    #[test]
    fn test_observer_may_read_state() {
        let machine = Arc::new(StateMachine::new());
        let seen = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&machine);
        let slot = Arc::clone(&seen);
        machine.subscribe(move |_, _| *slot.lock() = Some(inner.current()));

        machine.transition(ConnectionState::Connecting);
        assert_eq!(*seen.lock(), Some(ConnectionState::Connecting));
    }

    #[test]
    fn test_unsubscribe() {
        let machine = StateMachine::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = machine.subscribe(move |_, _| *counter.lock() += 1);

        machine.transition(ConnectionState::Connecting);
        assert!(machine.unsubscribe(id));
        assert!(!machine.unsubscribe(id));
        machine.transition(ConnectionState::Connected);

        assert_eq!(*count.lock(), 1);
    }

    fn any_state() -> impl Strategy<Value = ConnectionState> {
        prop::sample::select(ConnectionState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_recorded_transitions_are_legal_and_never_self_loops(
            targets in prop::collection::vec(any_state(), 0..64)
        ) {
            let machine = StateMachine::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            machine.subscribe(move |old, new| sink.lock().push((old, new)));

            for target in targets {
                let before = machine.current();
                match machine.transition(target) {
                    Some(t) => prop_assert_eq!(t.old, before),
                    None => prop_assert_eq!(machine.current(), before),
                }
            }

            for (old, new) in seen.lock().iter() {
                prop_assert_ne!(old, new);
                prop_assert!(old.can_transition_to(*new));
            }
        }
    }
}
