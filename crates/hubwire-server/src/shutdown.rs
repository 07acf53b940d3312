//! Session tracking and graceful drain for a hub.
//!
//! Every session a hub serves runs inside the coordinator's tracker. A drain
//! cancels the shared token, then waits for the tracked sessions and collects
//! the reason each one ended.

use std::future::Future;
use std::time::Duration;

use hubwire_core::ConnectionId;
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::hub::DisconnectReason;

/// Drain deadline used when none is given.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of [`Hub::shutdown_gracefully`](crate::Hub::shutdown_gracefully).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that ended while the drain was running, with their reasons.
    pub disconnected: Vec<(ConnectionId, DisconnectReason)>,
    /// Sessions still running when the deadline passed.
    pub remaining: usize,
}

impl ShutdownReport {
    /// Whether every session ended before the deadline.
    pub fn completed(&self) -> bool {
        self.remaining == 0
    }

    /// How many drained sessions ended for `reason`.
    pub fn count(&self, reason: &DisconnectReason) -> usize {
        self.disconnected.iter().filter(|(_, r)| r == reason).count()
    }
}

/// Owns the shutdown token and the set of live sessions.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
    // `Some` only while a drain collects reasons.
    draining: Mutex<Option<Vec<(ConnectionId, DisconnectReason)>>>,
}

impl ShutdownCoordinator {
    pub(crate) fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            sessions: TaskTracker::new(),
            draining: Mutex::new(None),
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of sessions still running.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Cancel every session without waiting.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Run a session inside the tracker.
    pub(crate) async fn track<F>(&self, id: ConnectionId, session: F) -> DisconnectReason
    where
        F: Future<Output = DisconnectReason>,
    {
        // The reason is recorded before the tracker lets a drain finish.
        self.sessions
            .track_future(async {
                let reason = session.await;
                if let Some(drained) = self.draining.lock().as_mut() {
                    drained.push((id, reason.clone()));
                }
                reason
            })
            .await
    }

    /// Cancel the token and wait up to `timeout` for tracked sessions.
    pub(crate) async fn drain(&self, timeout: Duration) -> ShutdownReport {
        {
            let mut draining = self.draining.lock();
            if draining.is_none() {
                *draining = Some(Vec::new());
            }
        }
        let live = self.sessions.len();
        info!(sessions = live, timeout_ms = timeout.as_millis() as u64, "draining sessions");

        self.token.cancel();
        let _ = self.sessions.close();
        let finished = tokio::time::timeout(timeout, self.sessions.wait()).await.is_ok();

        let disconnected = self.draining.lock().take().unwrap_or_default();
        let remaining = if finished { 0 } else { self.sessions.len() };
        if finished {
            info!(drained = disconnected.len(), "all sessions closed");
        } else {
            warn!(drained = disconnected.len(), remaining, "drain timed out after {timeout:?}");
        }
        ShutdownReport { disconnected, remaining }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn coordinator() -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::with_token(CancellationToken::new()))
    }

    /// A session that lives until shutdown.
    fn spawn_session(coord: &Arc<ShutdownCoordinator>) -> (ConnectionId, tokio::task::JoinHandle<DisconnectReason>) {
        let id = ConnectionId::new();
        let coord = Arc::clone(coord);
        let handle = tokio::spawn(async move {
            let token = coord.token();
            coord
                .track(id, async move {
                    token.cancelled().await;
                    DisconnectReason::ServerShutdown
                })
                .await
        });
        (id, handle)
    }

    #[tokio::test]
    async fn drain_reports_each_session() {
        let coord = coordinator();
        let (a, _) = spawn_session(&coord);
        let (b, _) = spawn_session(&coord);
        while coord.session_count() < 2 {
            tokio::task::yield_now().await;
        }

        let report = coord.drain(Duration::from_secs(1)).await;
        assert!(report.completed());
        assert!(coord.is_shutting_down());
        assert_eq!(report.count(&DisconnectReason::ServerShutdown), 2);
        let mut ids: Vec<_> = report.disconnected.iter().map(|(id, _)| *id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(coord.session_count(), 0);
    }

    #[tokio::test]
    async fn sessions_ended_before_drain_are_not_reported() {
        let coord = coordinator();
        let reason = coord
            .track(ConnectionId::new(), async { DisconnectReason::ClientClosed })
            .await;
        assert_eq!(reason, DisconnectReason::ClientClosed);

        let report = coord.drain(Duration::from_secs(1)).await;
        assert!(report.completed());
        assert!(report.disconnected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_on_stuck_session() {
        let coord = coordinator();
        let stuck = Arc::clone(&coord);
        let _task = tokio::spawn(async move {
            stuck
                .track(ConnectionId::new(), async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    DisconnectReason::ServerClosed
                })
                .await
        });
        while coord.session_count() < 1 {
            tokio::task::yield_now().await;
        }

        let report = coord.drain(Duration::from_millis(50)).await;
        assert!(!report.completed());
        assert_eq!(report.remaining, 1);
        assert!(report.disconnected.is_empty());
    }

    #[test]
    fn cancel_trips_the_shared_token() {
        let coord = coordinator();
        let token = coord.token();
        coord.cancel();
        coord.cancel();
        assert!(token.is_cancelled());
        assert!(coord.is_shutting_down());
    }
}
