//! Serving state of the request server and drain of running invocations.
//!
//! Probes read the health state from an `ArcSwap` without locking. Handlers
//! that run a function synchronously hold an [`InFlightGuard`]; the count
//! lives in a `watch` channel so a drain wakes on the last release instead
//! of polling.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    /// No longer accepting; running invocations may still finish.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    running: Arc<watch::Sender<usize>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            running: Arc::new(watch::Sender::new(0)),
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Moves to `Draining`. Readiness probes start failing from here on.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    /// Counts one running invocation until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.running.send_modify(|n| *n += 1);
        InFlightGuard {
            running: Arc::clone(&self.running),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        *self.running.borrow()
    }

    /// Waits for every guard to be released, at most `timeout`.
    ///
    /// Moves to `Stopped` and returns `true` once nothing is running; on
    /// timeout the state stays `Draining` and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.running.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Released on drop, unwinding included.
#[derive(Debug)]
pub struct InFlightGuard {
    running: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}
