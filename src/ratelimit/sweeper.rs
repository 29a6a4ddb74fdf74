//! Background reclamation of idle windows.
//!
//! Sweeping only frees memory. Expired timestamps are also pruned inline on
//! every check, so a late or skipped sweep never changes a decision.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::WindowBackend;
use super::clock::Clock;
use super::limiter::RateLimiter;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically removes windows idle for longer than the largest policy window.
pub struct Sweeper {
    backend: Arc<dyn WindowBackend>,
    clock: Arc<dyn Clock>,
    horizon_ms: u64,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        backend: Arc<dyn WindowBackend>,
        clock: Arc<dyn Clock>,
        horizon_ms: u64,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            horizon_ms,
            interval,
        }
    }

    /// A sweeper for the limiter's backend, using its largest policy window.
    pub fn for_limiter(limiter: &RateLimiter, interval: Duration) -> Self {
        Self::new(
            Arc::clone(limiter.backend()),
            Arc::clone(limiter.clock()),
            limiter.registry().max_window_ms(),
            interval,
        )
    }

    /// Run a single sweep and return the number of windows removed.
    pub async fn run_once(&self) -> usize {
        let removed = self
            .backend
            .sweep(self.clock.now_ms(), self.horizon_ms)
            .await;
        if removed > 0 {
            debug!(removed, backend = self.backend.name(), "Swept idle windows");
        }
        removed
    }

    /// Start sweeping on the current Tokio runtime.
    pub fn spawn(self) -> SweeperHandle {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            horizon_ms = self.horizon_ms,
            "Starting window sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; nothing is stale yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        });

        SweeperHandle { task }
    }
}

/// Owns the sweeper task. Dropping the handle stops the task.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
