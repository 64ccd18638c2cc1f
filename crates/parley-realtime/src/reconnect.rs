//! Reconnection policy and exponential backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::warn;

/// Default maximum number of reconnection attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnection attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5_000);

/// How the last connection ended, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Closure {
    /// The manager has been disposed.
    pub disposed: bool,
    /// The caller asked for the disconnect.
    pub caller_initiated: bool,
}

impl Closure {
    /// A closure the caller did not ask for.
    #[must_use]
    pub const fn abnormal() -> Self {
        Self {
            disposed: false,
            caller_initiated: false,
        }
    }
}

/// Decides whether and when to retry after a connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether automatic reconnection is enabled at all.
    pub enabled: bool,
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
    /// Delay before attempt 1; doubles on every further attempt.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether another attempt may follow `attempt` failed attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32, closure: Closure) -> bool {
        self.enabled && attempt < self.max_attempts && !closure.disposed && !closure.caller_initiated
    }

    /// Delay before `attempt` (1-based): `base_delay * 2^(attempt - 1)`.
    ///
    /// Attempt 0 is not a valid input and is treated as attempt 1.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = if attempt == 0 {
            warn!("reconnect delay requested for attempt 0, treating as attempt 1");
            1
        } else {
            attempt
        };
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor)
    }
}

/// Attempt counter shared between the manager and its reconnect loop.
#[derive(Debug, Default)]
pub struct ReconnectCounter(AtomicU32);

impl ReconnectCounter {
    /// Create a counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Current attempt count.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Record one more scheduled attempt and return its number.
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Reset after a successful connection.
    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}
