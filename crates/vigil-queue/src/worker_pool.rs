//! Named worker registry with supervised tasks.
//!
//! Every worker runs on its own tokio task under a child of the pool's
//! cancellation token. Removing one worker cancels only its child token;
//! shutting the pool down cancels the root token and, when asked to wait,
//! joins every task within a deadline.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{QueueError, Result},
    worker::{Worker, WorkerShared, WorkerStats},
};

struct WorkerHandle {
    worker: Arc<Worker>,
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the engine's named polling workers.
pub struct WorkerPoolManager {
    shared: Arc<WorkerShared>,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    cancellation_token: CancellationToken,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerPoolManager {
    /// Creates an empty pool.
    pub fn new(shared: Arc<WorkerShared>) -> Self {
        Self {
            shared,
            workers: RwLock::new(HashMap::new()),
            cancellation_token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Registers and starts a worker polling with `concurrency` slots.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` once the pool has been shut down
    /// - `InvalidInput` for an empty id or zero concurrency
    /// - `WorkerExists` if the id is already registered
    pub async fn add_worker(&self, worker_id: &str, concurrency: usize) -> Result<()> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        if worker_id.trim().is_empty() {
            return Err(QueueError::invalid_input("worker id must not be empty"));
        }
        if concurrency == 0 {
            return Err(QueueError::invalid_input("worker concurrency must be greater than 0"));
        }

        let mut workers = self.workers.write().await;
        if workers.contains_key(worker_id) {
            return Err(QueueError::worker_exists(worker_id));
        }

        let cancellation_token = self.cancellation_token.child_token();
        let worker = Arc::new(Worker::new(
            worker_id,
            concurrency,
            self.shared.clone(),
            cancellation_token.clone(),
        ));

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        workers.insert(worker_id.to_string(), WorkerHandle { worker, cancellation_token, task });
        info!(worker_id, concurrency, total_workers = workers.len(), "worker added");
        drop(workers);

        Ok(())
    }

    /// Cancels and unregisters a worker.
    ///
    /// The task is detached: a batch it already claimed still finishes.
    ///
    /// # Errors
    ///
    /// Returns `WorkerNotFound` if no worker has this id.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let handle = self
            .workers
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| QueueError::worker_not_found(worker_id))?;

        handle.cancellation_token.cancel();
        info!(worker_id, "worker removed");
        Ok(())
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Registered worker ids, sorted.
    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counters of every registered worker, sorted by id.
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        let mut stats: Vec<_> =
            self.workers.read().await.values().map(|handle| handle.worker.stats()).collect();
        stats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        stats
    }

    /// Whether `shutdown` or `cancel_all` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Cancels every worker without waiting for them.
    pub fn cancel_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancellation_token.cancel();
    }

    /// Cancels every worker and waits up to `timeout` for their tasks.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if some task is still running at the
    /// deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.cancel_all();

        let handles: Vec<_> = self.workers.write().await.drain().collect();
        info!(
            worker_count = handles.len(),
            timeout_ms = timeout.as_millis() as u64,
            "initiating worker shutdown"
        );

        let join_all_workers = async {
            for (worker_id, handle) in handles {
                if let Err(join_error) = handle.task.await {
                    error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(timeout, join_all_workers).await.is_err() {
            error!(
                timeout_ms = timeout.as_millis() as u64,
                "worker shutdown timed out, some workers may still be running"
            );
            return Err(QueueError::ShutdownTimeout { timeout });
        }

        info!("worker pool shutdown completed");
        Ok(())
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        if self.cancellation_token.is_cancelled() {
            return;
        }

        let running = self.workers.get_mut().values().filter(|h| !h.task.is_finished()).count();
        if running > 0 {
            self.cancellation_token.cancel();
            warn!(
                running_workers = running,
                "worker pool dropped without shutdown, cancelling workers"
            );
        }
    }
}
