//! Recovery of jobs whose worker died mid-flight.
//!
//! An active job whose attempt started more than `stalled_interval` ago is
//! considered stalled. The reaper returns it to the waiting state, or fails
//! it once either its retry budget or its stall budget is spent. Both writes
//! are conditional on the job still being on the same attempt, so a job that
//! completes while the reaper looks at it is left alone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{Clock, EventHandler, FailureReason, Job, JobEvent};

use crate::{config::WorkerPoolConfig, error::Result, store::JobStore};

/// Stalled jobs examined per pass.
const REAP_BATCH_LIMIT: usize = 100;

/// Jobs touched by one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Jobs returned to waiting.
    pub reclaimed: usize,
    /// Jobs moved to failed.
    pub failed: usize,
}

/// Periodic stalled-job scan.
#[derive(Debug)]
pub struct StalledJobReaper {
    store: Arc<JobStore>,
    events: Arc<dyn EventHandler>,
    config: Arc<WorkerPoolConfig>,
    clock: Arc<dyn Clock>,
}

impl StalledJobReaper {
    /// Creates a reaper over `store`.
    pub fn new(
        store: Arc<JobStore>,
        events: Arc<dyn EventHandler>,
        config: Arc<WorkerPoolConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, events, config, clock }
    }

    /// Runs `reap_once` every `reaper_interval` until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            interval_ms = self.config.reaper_interval.as_millis() as u64,
            stalled_interval_ms = self.config.stalled_interval.as_millis() as u64,
            "stalled job reaper starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.reaper_interval) => {}
                () = cancellation_token.cancelled() => break,
            }

            match self.reap_once().await {
                Ok(outcome) if outcome == ReapOutcome::default() => {},
                Ok(outcome) => info!(
                    reclaimed = outcome.reclaimed,
                    failed = outcome.failed,
                    "reaper recovered stalled jobs"
                ),
                Err(e) => warn!(error = %e, "reaper pass failed"),
            }
        }

        info!("stalled job reaper stopped");
    }

    /// Scans for stalled jobs once.
    ///
    /// # Errors
    ///
    /// Returns an error if the stalled-jobs query fails. Per-job write
    /// failures are logged and skipped.
    pub async fn reap_once(&self) -> Result<ReapOutcome> {
        let now = self.clock.now_utc();
        let Some(cutoff) = chrono::Duration::from_std(self.config.stalled_interval)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(ReapOutcome::default());
        };

        let stalled = self.store.stalled(cutoff, REAP_BATCH_LIMIT).await?;
        let mut outcome = ReapOutcome::default();

        for job in stalled {
            let exhausted = job.retry_count >= self.config.max_retries
                || job.stalled_count >= self.config.max_stalled_count;

            if exhausted {
                if self.fail(&job).await {
                    outcome.failed += 1;
                }
            } else if self.reclaim(&job).await {
                outcome.reclaimed += 1;
            }
        }

        Ok(outcome)
    }

    async fn reclaim(&self, job: &Job) -> bool {
        match self.store.reclaim_stalled(job).await {
            Ok(true) => {
                let retry_count = job.retry_count + 1;
                let stalled_count = job.stalled_count + 1;
                warn!(
                    job_id = %job.id,
                    worker_id = job.worker_id.as_deref().unwrap_or("unknown"),
                    retry_count,
                    stalled_count,
                    "reclaimed stalled job"
                );
                self.events
                    .handle_event(JobEvent::StalledReclaimed {
                        job_id: job.id,
                        retry_count,
                        stalled_count,
                        at: self.clock.now_utc(),
                    })
                    .await;
                true
            },
            Ok(false) => {
                debug!(job_id = %job.id, "stalled job changed before reclamation");
                false
            },
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to reclaim stalled job");
                false
            },
        }
    }

    async fn fail(&self, job: &Job) -> bool {
        let message = format!(
            "job stalled {} times after {} retries",
            job.stalled_count + 1,
            job.retry_count
        );
        let now = self.clock.now_utc();

        match self.store.fail_stalled(job, &message, now).await {
            Ok(true) => {
                error!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    stalled_count = job.stalled_count,
                    "stalled job failed permanently"
                );
                self.events
                    .handle_event(JobEvent::Failed {
                        job_id: job.id,
                        retry_count: job.retry_count,
                        reason: FailureReason::Stalled,
                        error: message,
                        at: now,
                    })
                    .await;
                true
            },
            Ok(false) => {
                debug!(job_id = %job.id, "stalled job changed before failing it");
                false
            },
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to fail stalled job");
                false
            },
        }
    }
}
