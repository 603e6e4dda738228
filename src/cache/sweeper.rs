//! Background sweep of expired cache entries
//!
//! Each cache gets one sweeper task, started when the cache is set up and
//! stopped when it is torn down. A sweep drops in-memory entries past the
//! grace window and purges the persisted store with the same rule.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::CoalescingCache;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries dropped from memory
    pub memory: usize,
    /// Documents deleted from the persisted store
    pub persisted: usize,
}

/// Runs one sweep over `cache` and its persisted store, if any
///
/// Store failures are logged and counted as nothing purged.
pub fn sweep_once<V>(cache: &CoalescingCache<V>) -> SweepReport
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let grace = cache.options().grace;
    let memory = cache.cleanup_expired(grace);

    let persisted = match cache.store() {
        Some(store) => match store.purge_expired(grace) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(cache = cache.name(), error = %err, "failed to purge persisted store");
                0
            }
        },
        None => 0,
    };

    SweepReport { memory, persisted }
}

/// Handle for a cache's background sweeper
///
/// Dropping the handle aborts the task; [`shutdown`](Self::shutdown) stops it
/// gracefully.
#[derive(Debug)]
pub struct SweepHandle {
    /// Flag to signal shutdown
    shutdown_tx: mpsc::Sender<()>,
    /// The sweeper task
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Spawns a sweeper for `cache` ticking every `sweep_interval`
    ///
    /// The first tick fires one interval after spawning, not immediately.
    pub fn spawn<V>(cache: CoalescingCache<V>, sweep_interval: Duration) -> Self
    where
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            // Skip the first tick (immediate)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = sweep_once(&cache);
                        if report != SweepReport::default() {
                            info!(
                                cache = cache.name(),
                                memory = report.memory,
                                persisted = report.persisted,
                                "sweep removed expired entries"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Stops the sweeper and waits for it to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
