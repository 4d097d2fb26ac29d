//! Ownership of the node's background tasks.
//!
//! Every long-lived or fire-and-forget task the node starts (the inbound
//! dispatch loop, liveness probes, value-caching stores) is spawned through
//! a [`TaskSupervisor`]. Shutdown signals all of them, waits up to a grace
//! period, then aborts whatever is left.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Owns the node's background tasks and stops them together.
pub struct TaskSupervisor {
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl TaskSupervisor {
    /// A supervisor with no tasks.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    /// Spawn `fut`. It is dropped at its next await point once shutdown
    /// starts. Does nothing if shutdown has already started.
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Checked under the lock: `shutdown` flags first, then takes the set.
        let mut tasks = self.lock();
        if self.is_shutting_down() {
            debug!(task = name, "Supervisor stopping, task not started");
            return;
        }
        let mut stop = self.shutdown.subscribe();
        reap(&mut tasks);
        tasks.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = stop.wait_for(|stopping| *stopping) => {
                    debug!(task = name, "Task cancelled by shutdown");
                }
            }
        });
    }

    /// Number of tasks not yet reaped.
    pub fn active(&self) -> usize {
        let mut tasks = self.lock();
        reap(&mut tasks);
        tasks.len()
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal every task to stop and wait up to `grace` for them.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut tasks = std::mem::take(&mut *self.lock());
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "Supervised task panicked");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Aborting tasks after shutdown grace period");
            tasks.shutdown().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!(error = %e, "Supervised task panicked");
            }
        }
    }
}
