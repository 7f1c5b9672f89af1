//! Pool lifecycle state machine.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Pool state (orderly-shutdown machine).
///
/// State transitions:
/// - Running -> ShuttingDown (`shutdown` / `shutdown_now`)
/// - ShuttingDown -> Stopped (last worker gone and queue drained)
///
/// Stopped is terminal. There is no restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Accepting submissions.
    Running,

    /// Draining: no new submissions, queued work still runs.
    ShuttingDown,

    /// Fully terminated.
    Stopped,
}

impl PoolState {
    /// Has shutdown been initiated (ShuttingDown or Stopped)?
    pub fn is_shutdown(self) -> bool {
        !matches!(self, PoolState::Running)
    }
}

/// Shared lifecycle cell: CAS-style transitions over a watch channel so
/// waiters never miss the edge.
pub(crate) struct LifecycleSignal {
    state: watch::Sender<PoolState>,
}

impl LifecycleSignal {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(PoolState::Running);
        Self { state }
    }

    pub(crate) fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Running -> ShuttingDown. False when shutdown had already begun.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == PoolState::Running {
                *s = PoolState::ShuttingDown;
                true
            } else {
                false
            }
        })
    }

    /// ShuttingDown -> Stopped. False unless draining had finished here.
    pub(crate) fn finish(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == PoolState::ShuttingDown {
                *s = PoolState::Stopped;
                true
            } else {
                false
            }
        })
    }

    /// Completes once the pool reaches Stopped.
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in the pool, so the channel cannot close first.
        let _ = rx.wait_for(|s| *s == PoolState::Stopped).await;
    }

    /// Completes once shutdown has been initiated (or already was).
    pub(crate) async fn wait_shutdown(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[test]
    fn shutdown_is_one_way_and_idempotent() {
        let signal = LifecycleSignal::new();
        assert!(signal.is_running());

        assert!(signal.begin_shutdown());
        assert!(!signal.begin_shutdown());
        assert_eq!(signal.state(), PoolState::ShuttingDown);

        assert!(signal.finish());
        assert!(!signal.finish());
        assert!(!signal.begin_shutdown());
        assert_eq!(signal.state(), PoolState::Stopped);
    }

    #[test]
    fn finish_requires_shutting_down() {
        let signal = LifecycleSignal::new();
        assert!(!signal.finish());
        assert_eq!(signal.state(), PoolState::Running);
    }

    #[tokio::test]
    async fn waiters_observe_the_stopped_edge() {
        let signal = LifecycleSignal::new();

        signal.begin_shutdown();
        let waited = timeout(Duration::from_millis(50), signal.wait_stopped()).await;
        assert!(waited.is_err(), "not stopped yet");

        signal.finish();
        timeout(Duration::from_secs(1), signal.wait_stopped())
            .await
            .unwrap();

        // Late waiters see the sticky state immediately.
        timeout(Duration::from_secs(1), signal.wait_stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_shutdown_fires_on_the_first_transition() {
        let signal = LifecycleSignal::new();
        signal.begin_shutdown();
        timeout(Duration::from_secs(1), signal.wait_shutdown())
            .await
            .unwrap();
    }
}
