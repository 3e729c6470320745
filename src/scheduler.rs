//! Explicitly owned task scheduler.
//!
//! Every connection, tunnel direction and origin connection driver is spawned
//! through a [`Scheduler`] so the whole proxy can be torn down from one place
//! and so handlers can be exercised in tests without a global runtime setup.

use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct Scheduler {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Builds the multi-threaded runtime the binary runs the scheduler on.
    pub fn build_runtime(worker_threads: usize) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("bifrost-worker")
            .enable_all()
            .build()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Token cancelled when the scheduler shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every task and waits up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        debug!("Waiting for {} tasks to finish", self.tracker.len());
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Shutdown grace period of {:?} elapsed with {} tasks still running",
                grace,
                self.tracker.len()
            );
        }
    }
}
