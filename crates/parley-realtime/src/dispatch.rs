//! Routes events to consumer callbacks by tag.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace, warn};

use crate::error::Error;
use crate::events::{Event, EventTag};

/// A consumer callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A (possibly partial) table of handlers, at most one per tag.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: HashMap<EventTag, Handler>,
}

impl EventHandlers {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn on<F>(mut self, tag: EventTag, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(tag, handler);
        self
    }

    /// Set the handler for `tag`, replacing any existing one.
    pub fn insert<F>(&mut self, tag: EventTag, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.insert(tag, Arc::new(handler));
    }

    /// Remove the handler for `tag`.
    pub fn remove(&mut self, tag: EventTag) -> bool {
        self.handlers.remove(&tag).is_some()
    }

    /// Handler registered for `tag`.
    #[must_use]
    pub fn get(&self, tag: EventTag) -> Option<&Handler> {
        self.handlers.get(&tag)
    }

    /// Whether a handler is registered for `tag`.
    #[must_use]
    pub fn contains(&self, tag: EventTag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn merge(&mut self, partial: Self) {
        self.handlers.extend(partial.handlers);
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        tags.sort();
        f.debug_struct("EventHandlers").field("tags", &tags).finish()
    }
}

/// Result of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Handled,
    /// No handler was registered; the event was dropped.
    Unhandled,
    /// The handler panicked; the failure went to the error channel.
    Failed,
}

/// Invokes registered handlers and shields the caller from their panics.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    table: RwLock<EventHandlers>,
}

impl EventDispatcher {
    /// Create a dispatcher with an initial table.
    #[must_use]
    pub fn new(handlers: EventHandlers) -> Self {
        Self {
            table: RwLock::new(handlers),
        }
    }

    /// Set the handler for `tag`, replacing any existing one.
    pub fn register<F>(&self, tag: EventTag, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.table.write().insert(tag, handler);
    }

    /// Remove the handler for `tag`.
    pub fn unregister(&self, tag: EventTag) -> bool {
        self.table.write().remove(tag)
    }

    /// Merge a partial table; tags absent from `partial` keep their handler.
    pub fn update_handlers(&self, partial: EventHandlers) {
        self.table.write().merge(partial);
    }

    /// Remove every handler.
    pub fn clear(&self) {
        *self.table.write() = EventHandlers::new();
    }

    /// Whether a handler is registered for `tag`.
    #[must_use]
    pub fn has_handler(&self, tag: EventTag) -> bool {
        self.table.read().contains(tag)
    }

    /// Deliver `event` to its handler.
    pub fn dispatch(&self, event: &Event) -> DispatchOutcome {
        let tag = event.tag();
        // Clone out of the lock so handlers may re-register.
        let Some(handler) = self.table.read().get(tag).cloned() else {
            trace!(%tag, "no handler registered, dropping event");
            return DispatchOutcome::Unhandled;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(()) => DispatchOutcome::Handled,
            Err(payload) => {
                let failure = Error::HandlerExecution {
                    tag,
                    message: panic_message(payload.as_ref()),
                };
                warn!(%tag, error = %failure, "event handler panicked");
                if tag != EventTag::Error {
                    self.report(&failure);
                }
                DispatchOutcome::Failed
            }
        }
    }

    fn report(&self, failure: &Error) {
        let Some(handler) = self.table.read().get(EventTag::Error).cloned() else {
            return;
        };
        let event = Event::Error {
            message: failure.to_string(),
        };
        if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            error!(error = %failure, "error handler panicked while reporting handler failure");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
