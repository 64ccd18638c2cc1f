//! Client heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parley_proto::OutboundFrame;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handle for observing and stopping a heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    token: CancellationToken,
}

impl HeartbeatHandle {
    fn new(token: CancellationToken) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            sent: Arc::new(AtomicU64::new(0)),
            token,
        }
    }

    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of heartbeats handed to the transport.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Stop the task.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Send a heartbeat frame every `interval` until `token` is cancelled or the
/// outgoing channel closes. The first heartbeat goes out after one interval.
pub fn start_heartbeat_task(
    outgoing: mpsc::Sender<OutboundFrame>,
    interval: Duration,
    token: CancellationToken,
) -> HeartbeatHandle {
    let handle = HeartbeatHandle::new(token.clone());
    let running = Arc::clone(&handle.running);
    let sent = Arc::clone(&handle.sent);

    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = timer.tick() => {
                    if outgoing.send(OutboundFrame::heartbeat()).await.is_err() {
                        debug!("outgoing channel closed, stopping heartbeat");
                        break;
                    }
                    let count = sent.fetch_add(1, Ordering::SeqCst) + 1;
                    trace!(count, "heartbeat sent");
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_proto::FrameKind;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_on_each_tick() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = start_heartbeat_task(tx, Duration::from_secs(10), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(25)).await;
        let first = rx.recv().await.expect("first heartbeat");
        assert_eq!(first.kind, FrameKind::Heartbeat.as_wire());
        assert!(rx.recv().await.is_some());
        assert_eq!(handle.sent(), 2);
        assert!(handle.is_running());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_sent_before_first_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = start_heartbeat_task(tx, Duration::from_secs(10), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.sent(), 0);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_on_cancel() {
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let handle = start_heartbeat_task(tx, Duration::from_secs(1), token.clone());

        token.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!handle.is_running());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(8);
        let handle = start_heartbeat_task(tx, Duration::from_secs(1), CancellationToken::new());

        drop(rx);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!handle.is_running());
    }
}
