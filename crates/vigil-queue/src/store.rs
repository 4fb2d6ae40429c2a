//! Typed, guarded access to the job collection.
//!
//! `JobStore` turns lifecycle transitions into conditional document updates
//! and routes every call through the shared resilience stack:
//!
//! ```text
//! retry loop ─▶ rate limiter (mutations only) ─▶ circuit breaker ─▶ timeout ─▶ DocumentStore
//! ```
//!
//! Each transition is conditioned on the state the caller believes the job
//! is in, so a worker that lost a claim race, or whose job was reclaimed by
//! the reaper, sees `false` instead of overwriting someone else's write.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use vigil_core::{
    models::{fields, timestamp_value},
    Clock, Document, DocumentStore, Filter, Job, JobId, JobState, OrderBy, JOBS_COLLECTION,
};

use crate::{
    circuit::CircuitBreaker,
    error::{QueueError, Result},
    rate_limit::RateLimiter,
    retry::{retry_with_backoff, RetryPolicy},
};

/// Number of jobs in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Waiting jobs.
    pub waiting: usize,
    /// Active jobs.
    pub active: usize,
    /// Completed jobs.
    pub completed: usize,
    /// Failed jobs.
    pub failed: usize,
}

impl StateCounts {
    /// Jobs occupying queue capacity.
    pub fn in_queue(&self) -> usize {
        self.waiting + self.active
    }
}

/// Job collection behind the engine's circuit breaker and rate limiter.
#[derive(Debug)]
pub struct JobStore {
    store: Arc<dyn DocumentStore>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    operation_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    /// Wraps `store` with the given resilience primitives.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        operation_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, breaker, limiter, retry, operation_timeout, clock }
    }

    /// Circuit breaker guarding the store.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Inserts one waiting job.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let document = job.to_document()?;
        let document = &document;
        self.guarded("insert", true, move || self.store.insert(JOBS_COLLECTION, document.clone()))
            .await?;
        Ok(())
    }

    /// Inserts several waiting jobs in one batched call.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn insert_jobs(&self, jobs: &[Job]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let documents = jobs.iter().map(Job::to_document).collect::<vigil_core::Result<Vec<_>>>()?;
        let documents = &documents;
        self.guarded("batch_insert", true, move || {
            self.store.batch_insert(JOBS_COLLECTION, documents.clone())
        })
        .await?;
        Ok(())
    }

    /// Waiting jobs in claim order: priority desc, created_at asc, sequence asc.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn claimable(&self, limit: usize) -> Result<Vec<Job>> {
        let documents = self
            .guarded("query_claimable", false, move || {
                self.store.query(
                    JOBS_COLLECTION,
                    vec![Filter::eq(fields::STATE, JobState::Waiting)],
                    claim_order(),
                    Some(limit),
                )
            })
            .await?;
        parse_jobs(documents)
    }

    /// Claims a waiting job for `worker_id`.
    ///
    /// Returns `false` when another worker claimed it first.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn claim(&self, job_id: JobId, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let id = job_id.to_string();
        let update = document([
            (fields::STATE, JobState::Active.into()),
            (fields::WORKER_ID, Value::from(worker_id)),
            (fields::STARTED_AT, timestamp_value(now)),
        ]);

        self.conditional("claim", &id, vec![Filter::eq(fields::STATE, JobState::Waiting)], update)
            .await
    }

    /// Marks a job owned by `worker_id` as completed.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let update = document([
            (fields::STATE, JobState::Completed.into()),
            (fields::RESULT, result),
            (fields::COMPLETED_AT, timestamp_value(now)),
        ]);

        self.conditional("complete", &job_id.to_string(), owned_by(worker_id), update).await
    }

    /// Returns a job owned by `worker_id` to the waiting state with one more
    /// retry recorded.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn requeue(&self, job: &Job, worker_id: &str, error: &str) -> Result<bool> {
        let update = document([
            (fields::STATE, JobState::Waiting.into()),
            (fields::RETRY_COUNT, Value::from(job.retry_count.saturating_add(1))),
            (fields::LAST_ERROR, Value::from(error)),
            (fields::WORKER_ID, Value::Null),
            (fields::STARTED_AT, Value::Null),
        ]);

        self.conditional("requeue", &job.id.to_string(), owned_by(worker_id), update).await
    }

    /// Marks a job owned by `worker_id` as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let update = document([
            (fields::STATE, JobState::Failed.into()),
            (fields::ERROR, Value::from(error)),
            (fields::FAILED_AT, timestamp_value(now)),
        ]);

        self.conditional("fail", &job_id.to_string(), owned_by(worker_id), update).await
    }

    /// Active jobs whose current attempt started before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn stalled(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let documents = self
            .guarded("query_stalled", false, move || {
                self.store.query(
                    JOBS_COLLECTION,
                    vec![
                        Filter::eq(fields::STATE, JobState::Active),
                        Filter::lt(fields::STARTED_AT, timestamp_value(cutoff)),
                    ],
                    vec![OrderBy::asc(fields::STARTED_AT)],
                    Some(limit),
                )
            })
            .await?;
        parse_jobs(documents)
    }

    /// Returns a stalled job to the waiting state.
    ///
    /// Applies only if the job is still active with the same `started_at`,
    /// so a job that finished or was re-claimed meanwhile is left alone.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn reclaim_stalled(&self, job: &Job) -> Result<bool> {
        let update = document([
            (fields::STATE, JobState::Waiting.into()),
            (fields::RETRY_COUNT, Value::from(job.retry_count.saturating_add(1))),
            (fields::STALLED_COUNT, Value::from(job.stalled_count.saturating_add(1))),
            (fields::LAST_ERROR, Value::from("job stalled")),
            (fields::WORKER_ID, Value::Null),
            (fields::STARTED_AT, Value::Null),
        ]);

        self.conditional("reclaim_stalled", &job.id.to_string(), same_attempt(job), update).await
    }

    /// Marks a stalled job as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn fail_stalled(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let update = document([
            (fields::STATE, JobState::Failed.into()),
            (fields::ERROR, Value::from(error)),
            (fields::FAILED_AT, timestamp_value(now)),
        ]);

        self.conditional("fail_stalled", &job.id.to_string(), same_attempt(job), update).await
    }

    /// Looks a job up by id.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn find(&self, job_id: JobId) -> Result<Option<Job>> {
        let id = job_id.to_string();
        let id = &id;
        let documents = self
            .guarded("find", false, move || {
                self.store.query(
                    JOBS_COLLECTION,
                    vec![Filter::eq(fields::ID, id.as_str())],
                    Vec::new(),
                    Some(1),
                )
            })
            .await?;

        parse_jobs(documents).map(|jobs| jobs.into_iter().next())
    }

    /// Number of jobs in `state`.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn count(&self, state: JobState) -> Result<usize> {
        self.count_matching(vec![Filter::eq(fields::STATE, state)]).await
    }

    /// Number of jobs in every state.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn counts(&self) -> Result<StateCounts> {
        Ok(StateCounts {
            waiting: self.count(JobState::Waiting).await?,
            active: self.count(JobState::Active).await?,
            completed: self.count(JobState::Completed).await?,
            failed: self.count(JobState::Failed).await?,
        })
    }

    /// Jobs completed at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn completed_since(&self, since: DateTime<Utc>) -> Result<usize> {
        self.count_matching(vec![
            Filter::eq(fields::STATE, JobState::Completed),
            Filter::gte(fields::COMPLETED_AT, timestamp_value(since)),
        ])
        .await
    }

    /// Deletes completed and failed jobs that finished before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns the store, breaker or timeout error left after retries.
    pub async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut ids = Vec::new();
        for (state, finished_at) in
            [(JobState::Completed, fields::COMPLETED_AT), (JobState::Failed, fields::FAILED_AT)]
        {
            let documents = self
                .guarded("query_finished", false, move || {
                    self.store.query(
                        JOBS_COLLECTION,
                        vec![
                            Filter::eq(fields::STATE, state),
                            Filter::lt(finished_at, timestamp_value(cutoff)),
                        ],
                        Vec::new(),
                        None,
                    )
                })
                .await?;
            ids.extend(
                documents
                    .iter()
                    .filter_map(|doc| doc.get(fields::ID).and_then(Value::as_str))
                    .map(str::to_string),
            );
        }

        if ids.is_empty() {
            return Ok(0);
        }

        let ids = &ids;
        let deleted = self
            .guarded("batch_delete", true, move || {
                self.store.batch_delete(JOBS_COLLECTION, ids.clone())
            })
            .await?;
        debug!(deleted, "deleted finished jobs");
        Ok(deleted)
    }

    async fn count_matching(&self, filters: Vec<Filter>) -> Result<usize> {
        let filters = &filters;
        let documents = self
            .guarded("count", false, move || {
                self.store.query(JOBS_COLLECTION, filters.clone(), Vec::new(), None)
            })
            .await?;
        Ok(documents.len())
    }

    /// Applies a conditional update through the retry loop.
    ///
    /// A retried attempt can report `false` because an earlier attempt did
    /// land and the store only lost its acknowledgement. In that case the
    /// document is re-read and the update counts as applied when every
    /// written field already holds the written value.
    async fn conditional(
        &self,
        operation: &'static str,
        id: &str,
        conditions: Vec<Filter>,
        update: Document,
    ) -> Result<bool> {
        let attempts = AtomicU32::new(0);
        let (conditions, update, attempts_ref) = (&conditions, &update, &attempts);
        let applied = self
            .guarded(operation, true, move || {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                self.store.conditional_update(
                    JOBS_COLLECTION,
                    id,
                    conditions.clone(),
                    update.clone(),
                )
            })
            .await?;

        if applied || attempts.load(Ordering::SeqCst) <= 1 {
            return Ok(applied);
        }

        let current = self.find_document(id).await?;
        let landed = current.is_some_and(|document| {
            update.iter().all(|(field, value)| {
                document.get(field).unwrap_or(&Value::Null) == value
            })
        });
        if landed {
            debug!(operation, job_id = id, "earlier attempt was applied, acknowledgement lost");
        }
        Ok(landed)
    }

    async fn find_document(&self, id: &str) -> Result<Option<Document>> {
        let documents = self
            .guarded("find", false, move || {
                self.store.query(JOBS_COLLECTION, vec![Filter::eq(fields::ID, id)], Vec::new(), Some(1))
            })
            .await?;
        Ok(documents.into_iter().next())
    }

    /// Runs one store call through retry loop, limiter, breaker and timeout.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, mutating: bool, op: F) -> Result<T>
    where
        F: Fn() -> Fut + Sync,
        Fut: Future<Output = vigil_core::Result<T>> + Send,
    {
        let op = &op;
        let timeout = self.operation_timeout;

        retry_with_backoff(&self.retry, self.clock.as_ref(), operation, move || async move {
            if mutating {
                self.limiter.acquire().await;
            }

            self.breaker
                .execute(move || async move {
                    match tokio::time::timeout(timeout, op()).await {
                        Ok(result) => result.map_err(QueueError::from),
                        Err(_elapsed) => Err(QueueError::timeout(operation, timeout)),
                    }
                })
                .await
        })
        .await
    }
}

fn claim_order() -> Vec<OrderBy> {
    vec![
        OrderBy::desc(fields::PRIORITY),
        OrderBy::asc(fields::CREATED_AT),
        OrderBy::asc(fields::SEQUENCE),
    ]
}

fn owned_by(worker_id: &str) -> Vec<Filter> {
    vec![Filter::eq(fields::STATE, JobState::Active), Filter::eq(fields::WORKER_ID, worker_id)]
}

fn same_attempt(job: &Job) -> Vec<Filter> {
    let started_at = job.started_at.map_or(Value::Null, timestamp_value);
    vec![Filter::eq(fields::STATE, JobState::Active), Filter::eq(fields::STARTED_AT, started_at)]
}

fn document<const N: usize>(entries: [(&str, Value); N]) -> Document {
    entries.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

fn parse_jobs(documents: Vec<Document>) -> Result<Vec<Job>> {
    documents.into_iter().map(|doc| Job::from_document(doc).map_err(QueueError::from)).collect()
}

#[cfg(test)]
mod tests {
    use vigil_core::{store::memory::MemoryDocumentStore, JobMetadata, TestClock};

    use super::*;
    use crate::circuit::{CircuitConfig, CircuitState};

    struct Harness {
        docs: Arc<MemoryDocumentStore>,
        jobs: JobStore,
        clock: TestClock,
    }

    fn harness() -> Harness {
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let docs = Arc::new(MemoryDocumentStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "job-store",
            CircuitConfig::default(),
            shared_clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(1_000.0, 1_000.0, shared_clock.clone()));
        let jobs = JobStore::new(
            docs.clone(),
            breaker,
            limiter,
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            Duration::from_secs(5),
            shared_clock,
        );
        Harness { docs, jobs, clock }
    }

    fn job(h: &Harness, key: &str, priority: i32, sequence: u64) -> Job {
        Job::new(key, priority, JobMetadata::default(), sequence, h.clock.now_utc())
    }

    #[tokio::test]
    async fn claimable_orders_by_priority_then_age() {
        let h = harness();
        let low = job(&h, "low", 1, 0);
        let high_old = job(&h, "high-old", 9, 1);
        h.clock.advance(Duration::from_millis(5));
        let high_new = job(&h, "high-new", 9, 2);
        let mid = job(&h, "mid", 5, 3);
        h.jobs.insert_jobs(&[low, high_new, mid, high_old]).await.unwrap();

        let keys: Vec<_> =
            h.jobs.claimable(10).await.unwrap().into_iter().map(|j| j.payload_key).collect();

        assert_eq!(keys, ["high-old", "high-new", "mid", "low"]);
    }

    #[tokio::test]
    async fn second_claim_loses_the_race() {
        let h = harness();
        let job = job(&h, "provider", 0, 0);
        h.jobs.insert_job(&job).await.unwrap();
        let now = h.clock.now_utc();

        assert!(h.jobs.claim(job.id, "w1", now).await.unwrap());
        assert!(!h.jobs.claim(job.id, "w2", now).await.unwrap());

        let stored = h.jobs.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(stored.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn only_owner_can_complete() {
        let h = harness();
        let job = job(&h, "provider", 0, 0);
        h.jobs.insert_job(&job).await.unwrap();
        let now = h.clock.now_utc();
        h.jobs.claim(job.id, "w1", now).await.unwrap();

        let result = serde_json::json!({"status": "operational"});
        assert!(!h.jobs.complete(job.id, "w2", result.clone(), now).await.unwrap());
        assert!(h.jobs.complete(job.id, "w1", result.clone(), now).await.unwrap());

        let stored = h.jobs.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.result, Some(result));
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn requeue_clears_ownership_and_counts_retry() {
        let h = harness();
        let job = job(&h, "provider", 0, 0);
        h.jobs.insert_job(&job).await.unwrap();
        h.jobs.claim(job.id, "w1", h.clock.now_utc()).await.unwrap();

        assert!(h.jobs.requeue(&job, "w1", "upstream 503").await.unwrap());

        let stored = h.jobs.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("upstream 503"));
        assert!(stored.worker_id.is_none());
        assert!(stored.started_at.is_none());
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn counts_and_cleanup_follow_state() {
        let h = harness();
        let done = job(&h, "done", 0, 0);
        let broken = job(&h, "broken", 0, 1);
        let pending = job(&h, "pending", 0, 2);
        h.jobs.insert_jobs(&[done.clone(), broken.clone(), pending]).await.unwrap();

        let now = h.clock.now_utc();
        h.jobs.claim(done.id, "w1", now).await.unwrap();
        h.jobs.complete(done.id, "w1", Value::Null, now).await.unwrap();
        h.jobs.claim(broken.id, "w1", now).await.unwrap();
        h.jobs.fail(broken.id, "w1", "forbidden", now).await.unwrap();

        let counts = h.jobs.counts().await.unwrap();
        assert_eq!(counts, StateCounts { waiting: 1, active: 0, completed: 1, failed: 1 });
        assert_eq!(h.jobs.completed_since(now).await.unwrap(), 1);

        h.clock.advance(Duration::from_secs(60));
        let deleted = h.jobs.delete_finished_before(h.clock.now_utc()).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(h.docs.len(JOBS_COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn open_breaker_blocks_store_calls() {
        let h = harness();
        h.jobs.breaker().force_state(CircuitState::Open).await;

        let err = h.jobs.insert_job(&job(&h, "provider", 0, 0)).await.unwrap_err();

        assert!(matches!(err, QueueError::CircuitOpen { .. }));
        assert_eq!(h.docs.operation_counts().writes(), 0);
    }
}
