//! Public job queue API.
//!
//! `JobQueueEngine` wires the guarded store, worker pool, reaper and metrics
//! collector together and owns their background tasks.
//!
//! # Submission path
//!
//! ```text
//! queue_job ─▶ paused / shut down? ─▶ validate key ─▶ backpressure ─▶ insert ─▶ Queued event
//! ```
//!
//! Rejections (`ShuttingDown`, `InvalidInput`, `QueueFull`) are returned
//! before anything is written. The capacity check and the insert run under
//! one admission lock, so concurrent submitters cannot overshoot
//! `max_queue_size`. Everything after a successful insert is
//! asynchronous and observable through events, metrics and `get_status`.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{
    Clock, DocumentStore, EventHandler, Job, JobEvent, JobId, JobMetadata, JobState,
    NoOpEventHandler, RealClock,
};

use crate::{
    backpressure::BackpressureController,
    circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats},
    config::WorkerPoolConfig,
    error::{QueueError, Result},
    handler::JobHandler,
    metrics::{Health, MetricsCollector, MetricsSnapshot},
    rate_limit::RateLimiter,
    reaper::{ReapOutcome, StalledJobReaper},
    retry::RetryPolicy,
    store::JobStore,
    worker::{WorkerShared, WorkerStats},
    worker_pool::WorkerPoolManager,
};

/// Longest accepted payload key.
pub const MAX_PAYLOAD_KEY_LEN: usize = 256;

/// Name of the store dependency in breaker errors and logs.
const STORE_DEPENDENCY: &str = "job-store";

/// Queue health with the data it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Overall health.
    pub health: Health,
    /// Supporting detail.
    pub details: StatusDetails,
}

/// Detail section of `QueueStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDetails {
    /// Fresh metrics sample.
    pub metrics: MetricsSnapshot,
    /// Whether submissions and claims are paused.
    pub paused: bool,
    /// Whether shutdown has started.
    pub shutting_down: bool,
    /// Store circuit breaker state.
    pub circuit: CircuitStats,
    /// Per-worker counters.
    pub workers: Vec<WorkerStats>,
}

/// Resilient job queue engine.
pub struct JobQueueEngine {
    config: Arc<WorkerPoolConfig>,
    store: Arc<JobStore>,
    shared: Arc<WorkerShared>,
    pool: Arc<WorkerPoolManager>,
    reaper: Arc<StalledJobReaper>,
    metrics: Arc<MetricsCollector>,
    backpressure: BackpressureController,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    /// Held from the capacity check until the insert lands.
    admission: Mutex<()>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    cancellation_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobQueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueEngine")
            .field("config", &self.config)
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl JobQueueEngine {
    /// Creates an engine on the real clock with no event subscribers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `config` fails validation.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Result<Self> {
        Self::with_components(
            store,
            handler,
            Arc::new(NoOpEventHandler::new()),
            Arc::new(RealClock::new()),
            config,
        )
    }

    /// Creates an engine with an explicit event sink and clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `config` fails validation.
    pub fn with_components(
        store: Arc<dyn DocumentStore>,
        handler: Arc<dyn JobHandler>,
        events: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        config: WorkerPoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let breaker = Arc::new(CircuitBreaker::new(
            STORE_DEPENDENCY,
            CircuitConfig {
                failure_threshold: config.circuit_breaker_threshold,
                open_timeout: config.circuit_breaker_timeout,
            },
            clock.clone(),
        ));
        let limiter =
            Arc::new(RateLimiter::new(config.rate_limit_per_second, config.burst(), clock.clone()));
        let store = Arc::new(JobStore::new(
            store,
            breaker,
            limiter,
            RetryPolicy::from_config(&config),
            config.store_operation_timeout,
            clock.clone(),
        ));

        let shared = Arc::new(WorkerShared::new(
            store.clone(),
            handler,
            events.clone(),
            config.clone(),
            clock.clone(),
        ));
        let pool = Arc::new(WorkerPoolManager::new(shared.clone()));
        let reaper = Arc::new(StalledJobReaper::new(
            store.clone(),
            events.clone(),
            config.clone(),
            clock.clone(),
        ));
        let metrics = Arc::new(MetricsCollector::new(store.clone(), config.clone(), clock.clone()));
        let backpressure =
            BackpressureController::new(config.max_queue_size, config.backpressure_max_delay);

        Ok(Self {
            config,
            store,
            shared,
            pool,
            reaper,
            metrics,
            backpressure,
            events,
            clock,
            sequence: AtomicU64::new(0),
            admission: Mutex::new(()),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Checks the store and starts the reaper and metrics loops.
    ///
    /// Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` after shutdown, or the store error if the
    /// store cannot be reached.
    pub async fn initialize(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let mut background = self.background.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let counts = self.store.counts().await?;
        if counts.active > 0 {
            info!(
                active = counts.active,
                "found active jobs at startup, reaper will recover any that stalled"
            );
        }

        background.push(tokio::spawn({
            let reaper = self.reaper.clone();
            let token = self.cancellation_token.child_token();
            async move { reaper.run(token).await }
        }));
        background.push(tokio::spawn({
            let metrics = self.metrics.clone();
            let pool = self.pool.clone();
            let token = self.cancellation_token.child_token();
            async move { metrics.run(pool, token).await }
        }));

        self.initialized.store(true, Ordering::SeqCst);
        drop(background);

        info!(
            waiting = counts.waiting,
            max_queue_size = self.config.max_queue_size,
            max_retries = self.config.max_retries,
            "job queue engine initialized"
        );
        Ok(())
    }

    /// Submits one job.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` while paused or after shutdown
    /// - `NotInitialized` before `initialize`
    /// - `InvalidInput` for an empty, blank or oversized key
    /// - `QueueFull` when the queue has no room
    /// - store errors left after retries
    pub async fn queue_job(
        &self,
        payload_key: &str,
        priority: i32,
        metadata: JobMetadata,
    ) -> Result<JobId> {
        self.ensure_accepting()?;
        let payload_key = validate_key(payload_key)?;

        let admission = self.admission.lock().await;
        self.admit(1).await?;

        let job = Job::new(
            payload_key,
            priority,
            metadata,
            self.sequence.fetch_add(1, Ordering::SeqCst),
            self.clock.now_utc(),
        );
        self.store.insert_job(&job).await?;
        drop(admission);

        debug!(job_id = %job.id, payload_key, priority, "job queued");
        self.emit_queued(&job).await;
        Ok(job.id)
    }

    /// Submits a batch of jobs sharing one priority.
    ///
    /// An empty batch returns an empty list without any other check. A batch
    /// with any invalid key is rejected whole and nothing is inserted.
    ///
    /// # Errors
    ///
    /// Same as `queue_job`; `QueueFull` if the whole batch does not fit.
    pub async fn queue_batch<S: AsRef<str>>(
        &self,
        payload_keys: &[S],
        batch_id: Option<&str>,
        priority: i32,
    ) -> Result<Vec<JobId>> {
        if payload_keys.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_accepting()?;
        let keys = payload_keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                validate_key(key.as_ref()).map_err(|e| {
                    QueueError::invalid_input(format!("batch key at index {index}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let admission = self.admission.lock().await;
        self.admit(keys.len()).await?;

        let metadata = match batch_id {
            Some(batch_id) => JobMetadata::new("batch").with_batch(batch_id),
            None => JobMetadata::new("batch"),
        };
        let now = self.clock.now_utc();
        let jobs: Vec<_> = keys
            .into_iter()
            .map(|key| {
                Job::new(
                    key,
                    priority,
                    metadata.clone(),
                    self.sequence.fetch_add(1, Ordering::SeqCst),
                    now,
                )
            })
            .collect();

        self.store.insert_jobs(&jobs).await?;
        drop(admission);

        info!(
            job_count = jobs.len(),
            batch_id = batch_id.unwrap_or("-"),
            priority,
            "job batch queued"
        );
        for job in &jobs {
            self.emit_queued(job).await;
        }
        Ok(jobs.iter().map(|job| job.id).collect())
    }

    /// Starts a named worker.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before `initialize`, otherwise the pool's
    /// registration errors.
    pub async fn add_worker(&self, worker_id: &str, concurrency: usize) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(QueueError::NotInitialized);
        }
        self.pool.add_worker(worker_id, concurrency).await
    }

    /// Stops a named worker.
    ///
    /// # Errors
    ///
    /// Returns `WorkerNotFound` if no worker has this id.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.pool.remove_worker(worker_id).await
    }

    /// Per-worker counters.
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        self.pool.worker_stats().await
    }

    /// Samples queue counts now.
    ///
    /// # Errors
    ///
    /// Returns store errors left after retries.
    pub async fn get_metrics(&self) -> Result<MetricsSnapshot> {
        self.metrics.collect(self.pool.worker_count().await).await
    }

    /// Most recent sample taken by the metrics loop or `get_metrics`.
    pub async fn last_metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.latest().await
    }

    /// Health classification with supporting detail.
    ///
    /// # Errors
    ///
    /// Returns store errors left after retries.
    pub async fn get_status(&self) -> Result<QueueStatus> {
        let metrics = self.get_metrics().await?;
        let health = metrics.health();

        Ok(QueueStatus {
            health,
            details: StatusDetails {
                metrics,
                paused: self.is_paused(),
                shutting_down: self.shutting_down.load(Ordering::SeqCst),
                circuit: self.store.breaker().stats().await,
                workers: self.pool.worker_stats().await,
            },
        })
    }

    /// Rejects submissions and stops claims until `resume_queue`.
    ///
    /// Jobs already claimed still finish.
    pub fn pause_queue(&self) {
        self.shared.pause();
        info!("job queue paused");
    }

    /// Accepts submissions and claims again.
    pub fn resume_queue(&self) {
        self.shared.resume();
        info!("job queue resumed");
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    /// Store circuit breaker state.
    pub async fn circuit_state(&self) -> CircuitState {
        self.store.breaker().state().await
    }

    /// Looks a job up by id.
    ///
    /// # Errors
    ///
    /// Returns store errors left after retries.
    pub async fn find_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.store.find(job_id).await
    }

    /// Runs one reaper pass immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the stalled-jobs query fails.
    pub async fn reap_stalled(&self) -> Result<ReapOutcome> {
        self.reaper.reap_once().await
    }

    /// Deletes completed and failed jobs that finished more than
    /// `older_than` ago.
    ///
    /// # Errors
    ///
    /// Returns store errors left after retries.
    pub async fn cleanup_finished(&self, older_than: Duration) -> Result<usize> {
        let now = self.clock.now_utc();
        let Some(cutoff) =
            chrono::Duration::from_std(older_than).ok().and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let deleted = self.store.delete_finished_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, older_than_secs = older_than.as_secs(), "cleaned up finished jobs");
        }
        Ok(deleted)
    }

    /// Stops the engine.
    ///
    /// Submissions and new workers are rejected from here on and every loop
    /// is cancelled. With `graceful` the call waits for worker tasks to end
    /// and for the store to report no active jobs, up to `shutdown_wait`.
    /// Otherwise it returns at once and leaves in-flight jobs to the reaper
    /// of a later engine.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if graceful shutdown runs out of time, or a
    /// store error raised while polling for active jobs.
    pub async fn shutdown(&self, graceful: bool) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return Ok(());
        }

        info!(graceful, "shutting down job queue engine");
        self.cancellation_token.cancel();

        if !graceful {
            self.pool.cancel_all();
            info!("job queue engine stopped without waiting for active jobs");
            return Ok(());
        }

        let wait = self.config.shutdown_wait;
        let started = self.clock.now();
        self.pool.shutdown(wait).await?;

        for handle in self.background.lock().await.drain(..) {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "background task panicked during shutdown");
            }
        }

        loop {
            let active = self.store.count(JobState::Active).await?;
            if active == 0 {
                break;
            }

            if self.clock.now().saturating_duration_since(started) >= wait {
                warn!(active, wait_ms = wait.as_millis() as u64, "active jobs remain after shutdown wait");
                return Err(QueueError::ShutdownTimeout { timeout: wait });
            }

            debug!(active, "waiting for active jobs to finish");
            self.clock.sleep(self.config.poll_interval).await;
        }

        info!("job queue engine shutdown completed");
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) || self.is_paused() {
            return Err(QueueError::ShuttingDown);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(QueueError::NotInitialized);
        }
        Ok(())
    }

    async fn admit(&self, incoming: usize) -> Result<()> {
        let current = self.store.count(JobState::Waiting).await?
            + self.store.count(JobState::Active).await?;
        self.backpressure.admit(current, incoming, self.clock.as_ref()).await
    }

    async fn emit_queued(&self, job: &Job) {
        self.events
            .handle_event(JobEvent::Queued {
                job_id: job.id,
                payload_key: job.payload_key.clone(),
                priority: job.priority,
                batch_id: job.metadata.batch_id.clone(),
                at: job.created_at,
            })
            .await;
    }
}

impl Drop for JobQueueEngine {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
            self.pool.cancel_all();
        }
    }
}

/// Trims a payload key and checks it is usable.
fn validate_key(key: &str) -> Result<&str> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(QueueError::invalid_input("payload key must not be empty"));
    }
    if trimmed.len() > MAX_PAYLOAD_KEY_LEN {
        return Err(QueueError::invalid_input(format!(
            "payload key exceeds {MAX_PAYLOAD_KEY_LEN} bytes"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(QueueError::invalid_input("payload key contains control characters"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use vigil_core::{store::memory::MemoryDocumentStore, TestClock};

    use super::*;
    use crate::handler::JobError;

    #[derive(Debug)]
    struct NullHandler;

    #[async_trait::async_trait]
    impl JobHandler for NullHandler {
        async fn handle(&self, _job: &Job) -> std::result::Result<Value, JobError> {
            Ok(Value::Null)
        }
    }

    fn engine(docs: Arc<MemoryDocumentStore>) -> JobQueueEngine {
        JobQueueEngine::with_components(
            docs,
            Arc::new(NullHandler),
            Arc::new(NoOpEventHandler::new()),
            Arc::new(TestClock::new()),
            WorkerPoolConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn key_validation() {
        assert_eq!(validate_key("  statuspage-github ").unwrap(), "statuspage-github");
        assert!(validate_key("").is_err());
        assert!(validate_key(" \t ").is_err());
        assert!(validate_key("a\nb").is_err());
        assert!(validate_key(&"x".repeat(MAX_PAYLOAD_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = WorkerPoolConfig { concurrency: 0, ..Default::default() };
        let result = JobQueueEngine::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(NullHandler),
            config,
        );
        assert!(matches!(result, Err(QueueError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn submissions_require_initialize() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let engine = engine(docs.clone());

        let err = engine.queue_job("github", 0, JobMetadata::default()).await.unwrap_err();
        assert_eq!(err, QueueError::NotInitialized);
        assert_eq!(engine.add_worker("w1", 1).await, Err(QueueError::NotInitialized));
        assert_eq!(docs.operation_counts().writes(), 0);
    }

    #[tokio::test]
    async fn batch_jobs_share_timestamp_and_keep_submission_order() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let engine = engine(docs);
        engine.initialize().await.unwrap();

        let ids = engine.queue_batch(&["a", "b"], Some("nightly"), 0).await.unwrap();

        let first = engine.find_job(ids[0]).await.unwrap().unwrap();
        let second = engine.find_job(ids[1]).await.unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(first.sequence < second.sequence);
        assert_eq!(second.metadata.batch_id.as_deref(), Some("nightly"));

        engine.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_work() {
        let engine = engine(Arc::new(MemoryDocumentStore::new()));
        engine.initialize().await.unwrap();

        engine.shutdown(false).await.unwrap();
        engine.shutdown(true).await.unwrap();

        assert_eq!(
            engine.queue_job("a", 0, JobMetadata::default()).await,
            Err(QueueError::ShuttingDown)
        );
        assert_eq!(engine.add_worker("w1", 1).await, Err(QueueError::ShuttingDown));
        assert_eq!(engine.initialize().await, Err(QueueError::ShuttingDown));
    }
}
