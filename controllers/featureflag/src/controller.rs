//! Controller runtime.
//!
//! Owns the worker loops and the start/stop lifecycle:
//!
//! ```text
//! Created -> CacheSyncing -> Running -> ShuttingDown -> Stopped
//!                  |                                      ^
//!                  +------ stop before caches sync -------+
//! ```
//!
//! The current state is published on a `watch` channel (used by `/readyz`).

use crate::cache::ResourceCache;
use crate::error::ControllerError;
use crate::metrics::{Metrics, RESULT_DROPPED, RESULT_REQUEUED, RESULT_SUCCESS};
use crate::reconciler::Reconciler;
use crate::workqueue::WorkQueue;
use crds::FeatureFlag;
use k8s_openapi::api::core::v1::ConfigMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`Controller`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `run` not called yet
    Created,
    /// Waiting for the initial listing of both caches
    CacheSyncing,
    /// Workers are processing keys
    Running,
    /// Stop requested; in-flight syncs are finishing
    ShuttingDown,
    /// All workers have exited
    Stopped,
}

/// FeatureFlag controller
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<String>>,
    flags: ResourceCache<FeatureFlag>,
    config_maps: ResourceCache<ConfigMap>,
    metrics: Arc<Metrics>,
    state: watch::Sender<ControllerState>,
}

impl Controller {
    /// Creates a controller in the `Created` state.
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: Arc<WorkQueue<String>>,
        flags: ResourceCache<FeatureFlag>,
        config_maps: ResourceCache<ConfigMap>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            reconciler,
            queue,
            flags,
            config_maps,
            metrics,
            state,
        }
    }

    /// Subscribes to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        debug!("Controller state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Waits for both caches, runs `workers` worker loops until `stop`
    /// resolves, then drains in-flight work and returns.
    ///
    /// Returns [`ControllerError::CacheSyncAborted`] if `stop` resolves before
    /// the caches have synced.
    pub async fn run(&self, workers: usize, stop: impl Future<Output = ()>) -> Result<(), ControllerError> {
        let mut stop = std::pin::pin!(stop);

        self.set_state(ControllerState::CacheSyncing);
        info!("Waiting for informer caches to sync");
        let synced = tokio::select! {
            result = async {
                tokio::try_join!(self.flags.wait_for_sync(), self.config_maps.wait_for_sync())
            } => result.map(|_| ()),
            () = &mut stop => Err(ControllerError::CacheSyncAborted),
        };
        if let Err(e) = synced {
            error!("Failed to sync caches: {}", e);
            self.queue.shutdown();
            self.set_state(ControllerState::Stopped);
            return Err(e);
        }

        info!(
            "Caches synced ({} {}s, {} {}s)",
            self.flags.list("").len(),
            self.flags.kind(),
            self.config_maps.list("").len(),
            self.config_maps.kind()
        );
        info!("Starting {} workers on queue '{}'", workers, self.queue.name());
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    reconciler: self.reconciler.clone(),
                    queue: self.queue.clone(),
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        self.set_state(ControllerState::Running);
        info!("Started workers");

        stop.await;

        self.set_state(ControllerState::ShuttingDown);
        info!("Shutting down workers");
        self.queue.shutdown();
        if !self.queue.is_empty() {
            info!("Leaving {} queued keys unprocessed", self.queue.len());
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        self.set_state(ControllerState::Stopped);
        info!("Controller stopped");
        Ok(())
    }
}

struct Worker {
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<String>>,
    metrics: Arc<Metrics>,
}

/// Calls `done` for a key when dropped, so every `get` is paired with exactly one `done`.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: String,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

impl Worker {
    async fn run(self) {
        debug!("Worker {} started", self.id);
        while let Some(key) = self.queue.get().await {
            let _done = DoneGuard {
                queue: &self.queue,
                key: key.clone(),
            };
            self.process(&key).await;
            self.metrics
                .workqueue_depth
                .set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
        }
        debug!("Worker {} stopped", self.id);
    }

    async fn process(&self, key: &str) {
        match self.reconciler.sync(key).await {
            Ok(()) => {
                self.queue.forget(&key.to_string());
                self.metrics.observe_sync(RESULT_SUCCESS);
                info!("Successfully synced '{}'", key);
            }
            Err(e) if e.is_retryable() => {
                let attempt = self.queue.num_requeues(&key.to_string()) + 1;
                warn!("Error syncing '{}' (attempt {}), requeuing: {}", key, attempt, e);
                self.queue.add_rate_limited(key.to_string());
                self.metrics.observe_sync(RESULT_REQUEUED);
            }
            Err(e) => {
                error!("Dropping '{}' out of the queue: {}", key, e);
                self.queue.forget(&key.to_string());
                self.metrics.observe_sync(RESULT_DROPPED);
            }
        }
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
