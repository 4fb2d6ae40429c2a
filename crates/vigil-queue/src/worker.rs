//! Polling worker that claims and processes jobs.
//!
//! Each tick a worker reads up to `min(concurrency, claim_batch_cap)` waiting
//! jobs in claim order, claims each with a conditional update, and runs the
//! claimed jobs through the handler in small concurrent sub-batches. Results
//! are written back conditionally on the worker still owning the job.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{Clock, EventHandler, FailureReason, Job, JobEvent, JobState};

use crate::{
    config::WorkerPoolConfig,
    error::Result,
    handler::{JobError, JobHandler},
    store::JobStore,
};

/// Dependencies shared by every worker of one engine.
#[derive(Debug)]
pub struct WorkerShared {
    /// Guarded job collection.
    pub store: Arc<JobStore>,
    /// Downstream work.
    pub handler: Arc<dyn JobHandler>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventHandler>,
    /// Engine configuration.
    pub config: Arc<WorkerPoolConfig>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    paused: AtomicBool,
}

impl WorkerShared {
    /// Bundles worker dependencies; starts unpaused.
    pub fn new(
        store: Arc<JobStore>,
        handler: Arc<dyn JobHandler>,
        events: Arc<dyn EventHandler>,
        config: Arc<WorkerPoolConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, handler, events, config, clock, paused: AtomicBool::new(false) }
    }

    /// Stops workers from claiming on their next tick.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Lets workers claim again.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether claiming is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Worker id.
    pub worker_id: String,
    /// Jobs this worker may run per tick.
    pub concurrency: usize,
    /// Jobs completed successfully.
    pub processed: u64,
    /// Jobs moved to `failed`.
    pub failed: u64,
    /// Jobs requeued after a failed attempt.
    pub retried: u64,
    /// Jobs currently in the handler.
    pub in_flight: u64,
}

/// A named polling loop.
#[derive(Debug)]
pub struct Worker {
    id: String,
    concurrency: usize,
    shared: Arc<WorkerShared>,
    cancellation_token: CancellationToken,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    in_flight: AtomicU64,
}

impl Worker {
    /// Creates a worker; it does nothing until `run` or `poll_once` is called.
    pub fn new(
        id: impl Into<String>,
        concurrency: usize,
        shared: Arc<WorkerShared>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            concurrency,
            shared,
            cancellation_token,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Worker id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of this worker's counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            concurrency: self.concurrency,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Polls on a fixed interval until cancelled.
    ///
    /// A claimed batch always runs to completion, even if cancellation
    /// arrives while it is being processed.
    pub async fn run(&self) {
        info!(worker_id = %self.id, concurrency = self.concurrency, "worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(0) => {},
                Ok(claimed) => debug!(worker_id = %self.id, claimed, "worker tick processed jobs"),
                Err(e) => warn!(worker_id = %self.id, error = %e, "worker poll failed"),
            }

            tokio::select! {
                () = self.shared.clock.sleep(self.shared.config.poll_interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Runs one poll tick and returns how many jobs were claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the claimable-jobs query fails. Failures while
    /// claiming or writing back individual jobs are logged, not returned.
    pub async fn poll_once(&self) -> Result<usize> {
        if self.shared.is_paused() {
            return Ok(0);
        }

        let limit = self.concurrency.min(self.shared.config.claim_batch_cap);
        let candidates = self.shared.store.claimable(limit).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let claimed = self.claim_all(candidates).await;
        let count = claimed.len();
        self.process_claimed(claimed).await;
        Ok(count)
    }

    async fn claim_all(&self, candidates: Vec<Job>) -> Vec<Job> {
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut job in candidates {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let now = self.shared.clock.now_utc();
            match self.shared.store.claim(job.id, &self.id, now).await {
                Ok(true) => {
                    job.state = JobState::Active;
                    job.worker_id = Some(self.id.clone());
                    job.started_at = Some(now);

                    debug!(worker_id = %self.id, job_id = %job.id, priority = job.priority, "claimed job");
                    self.shared
                        .events
                        .handle_event(JobEvent::Started {
                            job_id: job.id,
                            worker_id: self.id.clone(),
                            attempt: job.retry_count + 1,
                            at: now,
                        })
                        .await;
                    claimed.push(job);
                },
                Ok(false) => {
                    debug!(worker_id = %self.id, job_id = %job.id, "job claimed by another worker");
                },
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job.id, error = %e, "claim failed, ending claim pass");
                    break;
                },
            }
        }

        claimed
    }

    async fn process_claimed(&self, claimed: Vec<Job>) {
        let sub_batch_size = self.shared.config.sub_batch_size.max(1);
        let pause = self.shared.config.sub_batch_pause;

        for (index, sub_batch) in claimed.chunks(sub_batch_size).enumerate() {
            if index > 0 && pause > Duration::ZERO {
                self.shared.clock.sleep(pause).await;
            }
            join_all(sub_batch.iter().map(|job| self.process_job(job))).await;
        }
    }

    async fn process_job(&self, job: &Job) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = self.shared.clock.now();

        let outcome = self.shared.handler.handle(job).await;
        let elapsed = self.shared.clock.now().saturating_duration_since(started);

        match outcome {
            Ok(result) => self.finish_success(job, result, elapsed).await,
            Err(e) => self.finish_failure(job, e).await,
        }

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    async fn finish_success(&self, job: &Job, result: serde_json::Value, elapsed: Duration) {
        let now = self.shared.clock.now_utc();

        match self.shared.store.complete(job.id, &self.id, result, now).await {
            Ok(true) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "job completed"
                );
                self.shared
                    .events
                    .handle_event(JobEvent::Completed {
                        job_id: job.id,
                        worker_id: self.id.clone(),
                        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        at: now,
                    })
                    .await;
            },
            Ok(false) => {
                warn!(worker_id = %self.id, job_id = %job.id, "job no longer owned, dropping result");
            },
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to record completion");
            },
        }
    }

    async fn finish_failure(&self, job: &Job, failure: JobError) {
        let max_retries = self.shared.config.max_retries;

        if failure.retryable && job.retry_count < max_retries {
            self.requeue(job, &failure).await;
            return;
        }

        let reason = if failure.retryable {
            FailureReason::RetriesExhausted
        } else {
            FailureReason::Permanent
        };
        let now = self.shared.clock.now_utc();

        match self.shared.store.fail(job.id, &self.id, &failure.message, now).await {
            Ok(true) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    reason = ?reason,
                    error = %failure,
                    "job failed permanently"
                );
                self.shared
                    .events
                    .handle_event(JobEvent::Failed {
                        job_id: job.id,
                        retry_count: job.retry_count,
                        reason,
                        error: failure.message,
                        at: now,
                    })
                    .await;
            },
            Ok(false) => {
                warn!(worker_id = %self.id, job_id = %job.id, "job no longer owned, dropping failure");
            },
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to record job failure");
            },
        }
    }

    async fn requeue(&self, job: &Job, failure: &JobError) {
        match self.shared.store.requeue(job, &self.id, &failure.message).await {
            Ok(true) => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                let retry_count = job.retry_count + 1;
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    retry_count,
                    error = %failure,
                    "job attempt failed, requeued"
                );
                self.shared
                    .events
                    .handle_event(JobEvent::Retrying {
                        job_id: job.id,
                        retry_count,
                        error: failure.message.clone(),
                        at: self.shared.clock.now_utc(),
                    })
                    .await;
            },
            Ok(false) => {
                warn!(worker_id = %self.id, job_id = %job.id, "job no longer owned, skipping requeue");
            },
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to requeue job");
            },
        }
    }
}
