//! In-memory priority delivery queue.
//!
//! Jobs are kept in a binary heap ordered by priority, FIFO within a
//! priority band. A processing pass drains up to
//! `batch_size * max_concurrent_batches` ready jobs and fans their targets
//! out to the channel adapters:
//!
//! ```text
//!  pop ready jobs ─▶ drop inactive targets ─▶ group by channel ─▶ chunk to max_batch_size
//!                                                                       │
//!             ┌─────────────────────────────────────────────────────────┘
//!             ▼
//!  channel breaker ─▶ rate limiter ─▶ send_batch   (bounded concurrency, one pass deadline)
//!             │
//!             ▼
//!  settle per target: delivered │ invalid ─▶ removed in one batch
//!                               │ retryable ─▶ re-enqueued with backoff, priority - 1
//!                               │ permanent ─▶ counted failed
//!                               │ unconfirmed / breaker open ─▶ re-enqueued unchanged
//! ```
//!
//! Progress is tracked per target, so a target confirmed before the pass
//! deadline is never sent again, and one that was not confirmed is never
//! lost.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::Clock;
use vigil_queue::{CircuitBreaker, CircuitConfig, CircuitState, RateLimiter};

use crate::{
    channel::{BatchOutcome, DeliveryChannel, TargetOutcome},
    config::DeliveryConfig,
    error::{DeliveryError, Result},
    models::{ChannelKind, DeliveryId, DeliveryJob, Target},
    registry::SubscriptionRegistry,
};

/// Running totals of a delivery queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Jobs currently queued.
    pub queued: usize,
    /// Jobs accepted by `enqueue`.
    pub enqueued: u64,
    /// Targets delivered.
    pub delivered: u64,
    /// Targets that failed permanently.
    pub failed: u64,
    /// Jobs dropped after exhausting retries.
    pub dropped: u64,
    /// Subscriptions removed as invalid.
    pub invalid_removed: u64,
    /// Jobs re-enqueued for retry.
    pub requeued: u64,
    /// Subscriptions disabled after repeated failures.
    pub disabled: u64,
    /// Passes that hit the pass deadline.
    pub timed_out_passes: u64,
}

/// Result of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Jobs taken from the queue.
    pub jobs: usize,
    /// Targets skipped because their subscription is no longer active.
    pub skipped_inactive: usize,
    /// Targets delivered.
    pub delivered: usize,
    /// Targets that failed permanently.
    pub failed: usize,
    /// Subscriptions removed as invalid.
    pub invalid_removed: usize,
    /// Jobs re-enqueued with a retry increment.
    pub requeued: usize,
    /// Targets put back unchanged (breaker open or unconfirmed).
    pub deferred: usize,
    /// Jobs dropped after exhausting retries.
    pub dropped: usize,
    /// Subscriptions disabled in this pass.
    pub disabled: usize,
    /// Whether the pass deadline was hit.
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
struct ChannelSlot {
    channel: Arc<dyn DeliveryChannel>,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug)]
struct QueuedJob {
    priority: i32,
    sequence: u64,
    job: DeliveryJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Unit {
    job_index: usize,
    kind: ChannelKind,
    targets: Vec<Target>,
}

enum UnitOutcome {
    Sent(BatchOutcome),
    CallFailed { retryable: bool },
    BreakerOpen,
    TimedOut,
}

#[derive(Default)]
struct JobProgress {
    delivered: Vec<String>,
    invalid: Vec<String>,
    retry: Vec<Target>,
    permanent: Vec<Target>,
    deferred: Vec<Target>,
}

impl JobProgress {
    fn apply(&mut self, targets: Vec<Target>, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Sent(batch) => {
                let by_subscription = batch.by_subscription();
                for target in targets {
                    match by_subscription.get(target.subscription_id.as_str()) {
                        Some(TargetOutcome::Delivered) => self.delivered.push(target.subscription_id),
                        Some(TargetOutcome::Invalid { .. }) => self.invalid.push(target.subscription_id),
                        Some(TargetOutcome::Failed { retryable: false, .. }) => self.permanent.push(target),
                        Some(TargetOutcome::Failed { retryable: true, .. }) | None => self.retry.push(target),
                    }
                }
            },
            UnitOutcome::CallFailed { retryable: true } => self.retry.extend(targets),
            UnitOutcome::CallFailed { retryable: false } => self.permanent.extend(targets),
            UnitOutcome::BreakerOpen | UnitOutcome::TimedOut => self.deferred.extend(targets),
        }
    }
}

/// Owned in-memory delivery queue with its own processing loop.
pub struct DeliveryQueue {
    config: DeliveryConfig,
    channels: HashMap<ChannelKind, ChannelSlot>,
    registry: Arc<dyn SubscriptionRegistry>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    pending: Mutex<BinaryHeap<QueuedJob>>,
    sequence: AtomicU64,
    stats: Mutex<DeliveryStats>,
    pass_lock: Mutex<()>,
    stopped: AtomicBool,
    cancellation_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.config)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Creates an empty queue with no channels.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `config` fails validation.
    pub fn new(
        config: DeliveryConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_second,
            config.rate_limit_per_second.max(1.0),
            clock.clone(),
        ));

        Ok(Self {
            config,
            channels: HashMap::new(),
            registry,
            limiter,
            clock,
            pending: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            stats: Mutex::new(DeliveryStats::default()),
            pass_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Registers the adapter for its channel kind, replacing any previous
    /// one. Each channel gets its own circuit breaker.
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn DeliveryChannel>) -> Self {
        let kind = channel.kind();
        let breaker = Arc::new(CircuitBreaker::new(
            format!("channel:{kind}"),
            CircuitConfig {
                failure_threshold: self.config.circuit_breaker_threshold,
                open_timeout: self.config.circuit_breaker_timeout,
            },
            self.clock.clone(),
        ));
        self.channels.insert(kind, ChannelSlot { channel, breaker });
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Breaker state of a channel, if the channel is registered.
    pub async fn channel_state(&self, kind: ChannelKind) -> Option<CircuitState> {
        match self.channels.get(&kind) {
            Some(slot) => Some(slot.breaker.state().await),
            None => None,
        }
    }

    /// Breaker of a channel, for status reporting and operator overrides.
    pub fn channel_breaker(&self, kind: ChannelKind) -> Option<&Arc<CircuitBreaker>> {
        self.channels.get(&kind).map(|slot| &slot.breaker)
    }

    /// Adds a job to the queue.
    ///
    /// # Errors
    ///
    /// - `Stopped` after `stop`
    /// - `InvalidInput` for a job without targets
    /// - `QueueFull` at capacity
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<DeliveryId> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DeliveryError::Stopped);
        }
        if job.targets.is_empty() {
            return Err(DeliveryError::invalid_input("delivery job has no targets"));
        }

        let id = job.id;
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.config.max_queue_size {
            return Err(DeliveryError::QueueFull { max: self.config.max_queue_size });
        }

        debug!(
            delivery_id = %id,
            targets = job.targets.len(),
            priority = job.priority,
            "delivery job enqueued"
        );
        self.push(&mut pending, job);
        drop(pending);

        self.stats.lock().await.enqueued += 1;
        Ok(id)
    }

    /// Jobs currently queued.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Queued jobs in the order they would be popped, ignoring readiness.
    pub async fn snapshot(&self) -> Vec<DeliveryJob> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<_> = pending.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    /// Running totals.
    pub async fn stats(&self) -> DeliveryStats {
        let queued = self.len().await;
        DeliveryStats { queued, ..self.stats.lock().await.clone() }
    }

    /// Spawns the fixed-interval processing loop.
    ///
    /// Starting a running queue is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after `stop`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DeliveryError::Stopped);
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let queue = Arc::clone(self);
        let cancellation_token = self.cancellation_token.clone();
        *task = Some(tokio::spawn(async move { queue.run(cancellation_token).await }));

        info!(
            channels = self.channels.len(),
            interval_ms = self.config.process_interval.as_millis() as u64,
            "delivery queue started"
        );
        Ok(())
    }

    /// Stops accepting jobs and cancels the processing loop.
    ///
    /// A pass already running finishes first. Jobs still queued stay in
    /// memory and are reported in the log.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancellation_token.cancel();

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(join_error) = task.await {
                error!(error = %join_error, "delivery loop panicked");
            }
        }

        let remaining = self.len().await;
        if remaining > 0 {
            warn!(remaining, "delivery queue stopped with undelivered jobs");
        } else {
            info!("delivery queue stopped");
        }
    }

    async fn run(&self, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.process_interval) => {}
                () = cancellation_token.cancelled() => break,
            }

            match self.process_pass().await {
                Ok(report) if report.jobs == 0 => {},
                Ok(report) => debug!(
                    jobs = report.jobs,
                    delivered = report.delivered,
                    failed = report.failed,
                    requeued = report.requeued,
                    timed_out = report.timed_out,
                    "delivery pass finished"
                ),
                Err(e) => warn!(error = %e, "delivery pass failed"),
            }
        }
    }

    /// Runs one processing pass.
    ///
    /// # Errors
    ///
    /// Currently infallible; registry failures are logged per target.
    pub async fn process_pass(&self) -> Result<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let now = self.clock.now_utc();

        let jobs = self.take_ready(now, self.config.pass_capacity()).await;
        let mut report = PassReport { jobs: jobs.len(), ..PassReport::default() };
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut plans = Vec::with_capacity(jobs.len());
        for job in jobs {
            let active = self.active_targets(&job, &mut report).await;
            if !active.is_empty() {
                plans.push(job.with_targets(active));
            }
        }

        let mut progress: Vec<JobProgress> = plans.iter().map(|_| JobProgress::default()).collect();
        let units = self.plan_units(&plans, &mut progress);

        let deadline = self.clock.now() + self.config.pass_timeout;
        let plans_ref = &plans;
        let sends: Vec<_> = units
            .into_iter()
            .map(|unit| async move {
                let outcome = self.run_unit(&plans_ref[unit.job_index], &unit, deadline).await;
                (unit, outcome)
            })
            .collect();
        let mut outcomes =
            stream::iter(sends).buffer_unordered(self.config.max_concurrent_batches);

        while let Some((unit, outcome)) = outcomes.next().await {
            report.timed_out |= matches!(outcome, UnitOutcome::TimedOut);
            progress[unit.job_index].apply(unit.targets, outcome);
        }
        drop(outcomes);

        if report.timed_out {
            warn!(
                timeout_ms = self.config.pass_timeout.as_millis() as u64,
                "delivery pass hit its deadline, unconfirmed targets stay queued"
            );
        }

        self.settle(&plans, progress, now, &mut report).await;
        self.record(&report).await;
        Ok(report)
    }

    async fn take_ready(&self, now: DateTime<Utc>, limit: usize) -> Vec<DeliveryJob> {
        let mut pending = self.pending.lock().await;
        let mut ready = Vec::new();
        let mut waiting = Vec::new();

        while ready.len() < limit {
            let Some(entry) = pending.pop() else { break };
            if entry.job.is_ready(now) {
                ready.push(entry.job);
            } else {
                waiting.push(entry);
            }
        }
        pending.extend(waiting);
        ready
    }

    async fn active_targets(&self, job: &DeliveryJob, report: &mut PassReport) -> Vec<Target> {
        let mut active = Vec::with_capacity(job.targets.len());
        for target in &job.targets {
            match self.registry.is_active(&target.subscription_id).await {
                Ok(true) => active.push(target.clone()),
                Ok(false) => report.skipped_inactive += 1,
                Err(e) => {
                    warn!(
                        subscription_id = %target.subscription_id,
                        error = %e,
                        "subscription lookup failed, attempting delivery anyway"
                    );
                    active.push(target.clone());
                },
            }
        }
        active
    }

    fn plan_units(&self, plans: &[DeliveryJob], progress: &mut [JobProgress]) -> Vec<Unit> {
        let mut units = Vec::new();

        for (job_index, job) in plans.iter().enumerate() {
            let mut by_channel: BTreeMap<ChannelKind, Vec<Target>> = BTreeMap::new();
            for target in &job.targets {
                by_channel.entry(target.channel).or_default().push(target.clone());
            }

            for (kind, targets) in by_channel {
                let Some(slot) = self.channels.get(&kind) else {
                    error!(delivery_id = %job.id, channel = %kind, "no adapter registered for channel");
                    progress[job_index].permanent.extend(targets);
                    continue;
                };

                let chunk_size = slot.channel.max_batch_size().max(1);
                for chunk in targets.chunks(chunk_size) {
                    units.push(Unit { job_index, kind, targets: chunk.to_vec() });
                }
            }
        }
        units
    }

    async fn run_unit(&self, job: &DeliveryJob, unit: &Unit, deadline: Instant) -> UnitOutcome {
        let Some(slot) = self.channels.get(&unit.kind) else {
            return UnitOutcome::CallFailed { retryable: false };
        };
        let remaining = deadline.saturating_duration_since(self.clock.now());
        if remaining.is_zero() {
            return UnitOutcome::TimedOut;
        }
        if !slot.breaker.allow_request().await {
            debug!(channel = %unit.kind, targets = unit.targets.len(), "channel breaker open");
            return UnitOutcome::BreakerOpen;
        }

        let send = async {
            self.limiter.acquire().await;
            if self.clock.now() >= deadline {
                return None;
            }
            Some(slot.channel.send_batch(&unit.targets, &job.payload, job.retry_count).await)
        };

        match tokio::time::timeout(remaining, send).await {
            Ok(None) => {
                debug!(
                    channel = %unit.kind,
                    targets = unit.targets.len(),
                    "rate limit wait outlasted the pass"
                );
                UnitOutcome::TimedOut
            },
            Ok(Some(Ok(outcome))) => {
                if outcome.all_retryable_failures() {
                    slot.breaker.record_failure().await;
                } else {
                    slot.breaker.record_success().await;
                }
                UnitOutcome::Sent(outcome)
            },
            Ok(Some(Err(e))) => {
                slot.breaker.record_failure().await;
                warn!(channel = %unit.kind, delivery_id = %job.id, error = %e, "channel batch call failed");
                UnitOutcome::CallFailed { retryable: e.is_retryable() }
            },
            Err(_elapsed) => {
                slot.breaker.record_failure().await;
                UnitOutcome::TimedOut
            },
        }
    }

    async fn settle(
        &self,
        plans: &[DeliveryJob],
        progress: Vec<JobProgress>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        let mut invalid = Vec::new();

        for (job, progress) in plans.iter().zip(progress) {
            for subscription_id in &progress.delivered {
                if let Err(e) = self.registry.record_success(subscription_id).await {
                    warn!(subscription_id = %subscription_id, error = %e, "failed to record delivery success");
                }
            }
            report.delivered += progress.delivered.len();
            invalid.extend(progress.invalid);

            for target in progress.retry.iter().chain(&progress.permanent) {
                self.record_target_failure(&target.subscription_id, report).await;
            }
            report.failed += progress.permanent.len();

            if !progress.deferred.is_empty() {
                report.deferred += progress.deferred.len();
                self.push_back(job.with_targets(progress.deferred)).await;
            }

            if !progress.retry.is_empty() {
                self.schedule_retry(job, progress.retry, now, report).await;
            }
        }

        if !invalid.is_empty() {
            match self.registry.remove_batch(&invalid).await {
                Ok(removed) => {
                    report.invalid_removed = removed;
                    info!(removed, "removed invalid subscriptions");
                },
                Err(e) => error!(count = invalid.len(), error = %e, "failed to remove invalid subscriptions"),
            }
        }
    }

    async fn record_target_failure(&self, subscription_id: &str, report: &mut PassReport) {
        match self.registry.record_failure(subscription_id).await {
            Ok(failures) if failures >= self.config.disable_after_failures => {
                match self.registry.disable(subscription_id).await {
                    Ok(()) => {
                        report.disabled += 1;
                        warn!(subscription_id, failures, "subscription disabled after repeated failures");
                    },
                    Err(e) => warn!(subscription_id, error = %e, "failed to disable subscription"),
                }
            },
            Ok(_) => {},
            Err(e) => debug!(subscription_id, error = %e, "could not record delivery failure"),
        }
    }

    async fn schedule_retry(
        &self,
        job: &DeliveryJob,
        targets: Vec<Target>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        let retry_count = job.retry_count + 1;
        if retry_count > self.config.max_retries {
            error!(
                delivery_id = %job.id,
                retry_count = job.retry_count,
                targets = targets.len(),
                "delivery retries exhausted, dropping job"
            );
            report.dropped += 1;
            return;
        }

        let delay = self.config.backoff_for(job.retry_count);
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut next = job.with_targets(targets);
        next.retry_count = retry_count;
        next.priority = job.priority.saturating_sub(1);
        next.not_before = Some(not_before);

        debug!(
            delivery_id = %job.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            targets = next.targets.len(),
            "delivery job scheduled for retry"
        );
        report.requeued += 1;
        self.push_back(next).await;
    }

    async fn push_back(&self, job: DeliveryJob) {
        let mut pending = self.pending.lock().await;
        self.push(&mut pending, job);
    }

    fn push(&self, pending: &mut BinaryHeap<QueuedJob>, job: DeliveryJob) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        pending.push(QueuedJob { priority: job.priority, sequence, job });
    }

    async fn record(&self, report: &PassReport) {
        let mut stats = self.stats.lock().await;
        stats.delivered += report.delivered as u64;
        stats.failed += report.failed as u64;
        stats.dropped += report.dropped as u64;
        stats.invalid_removed += report.invalid_removed as u64;
        stats.requeued += report.requeued as u64;
        stats.disabled += report.disabled as u64;
        if report.timed_out {
            stats.timed_out_passes += 1;
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use vigil_core::TestClock;

    use super::*;
    use crate::{
        models::DeliveryPayload,
        registry::{MemorySubscriptionRegistry, Subscription},
    };

    #[derive(Debug)]
    struct AcceptAll;

    #[async_trait::async_trait]
    impl DeliveryChannel for AcceptAll {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Push
        }

        fn max_batch_size(&self) -> usize {
            10
        }

        async fn send_batch(
            &self,
            targets: &[Target],
            _payload: &DeliveryPayload,
            _attempt: u32,
        ) -> Result<BatchOutcome> {
            Ok(BatchOutcome::from_results(
                targets
                    .iter()
                    .map(|t| crate::channel::TargetResult::new(t, TargetOutcome::Delivered))
                    .collect(),
            ))
        }
    }

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            event_type: "provider.status_changed".into(),
            provider_id: "github".into(),
            status: "degraded".into(),
            message: None,
            occurred_at: Utc::now(),
            data: Value::Null,
        }
    }

    fn job(priority: i32, target: &str) -> DeliveryJob {
        DeliveryJob::new(
            vec![Target::new(target, ChannelKind::Push, format!("tok-{target}"))],
            payload(),
            priority,
            Utc::now(),
        )
    }

    async fn queue(config: DeliveryConfig) -> (Arc<MemorySubscriptionRegistry>, DeliveryQueue) {
        let registry = Arc::new(MemorySubscriptionRegistry::new());
        for id in ["a", "b", "c"] {
            registry.insert(Subscription::new(id, ChannelKind::Push, format!("tok-{id}"))).await;
        }
        let queue = DeliveryQueue::new(config, registry.clone(), Arc::new(TestClock::new()))
            .unwrap()
            .with_channel(Arc::new(AcceptAll));
        (registry, queue)
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let (_, queue) = queue(DeliveryConfig::default()).await;
        queue.enqueue(job(1, "a")).await.unwrap();
        queue.enqueue(job(5, "b")).await.unwrap();
        queue.enqueue(job(1, "c")).await.unwrap();

        let order: Vec<_> = queue
            .snapshot()
            .await
            .into_iter()
            .map(|j| j.targets[0].subscription_id.clone())
            .collect();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[tokio::test]
    async fn enqueue_rejects_when_full_or_stopped() {
        let config = DeliveryConfig { max_queue_size: 1, ..Default::default() };
        let (_, queue) = queue(config).await;

        queue.enqueue(job(0, "a")).await.unwrap();
        assert_eq!(queue.enqueue(job(0, "b")).await, Err(DeliveryError::QueueFull { max: 1 }));

        queue.stop().await;
        assert_eq!(queue.enqueue(job(0, "c")).await, Err(DeliveryError::Stopped));
    }

    #[tokio::test]
    async fn job_without_targets_is_invalid() {
        let (_, queue) = queue(DeliveryConfig::default()).await;
        let empty = DeliveryJob::new(Vec::new(), payload(), 0, Utc::now());
        assert!(matches!(queue.enqueue(empty).await, Err(DeliveryError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn pass_delivers_and_skips_inactive() {
        let (registry, queue) = queue(DeliveryConfig::default()).await;
        registry.disable("b").await.unwrap();
        queue.enqueue(job(0, "a")).await.unwrap();
        queue.enqueue(job(0, "b")).await.unwrap();

        let report = queue.process_pass().await.unwrap();

        assert_eq!(report.jobs, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped_inactive, 1);
        assert!(queue.is_empty().await);
        assert_eq!(queue.stats().await.delivered, 1);
    }

    #[tokio::test]
    async fn jobs_not_yet_due_stay_queued() {
        let (_, queue) = queue(DeliveryConfig::default()).await;
        let mut later = job(9, "a");
        later.not_before = Some(Utc::now() + chrono::Duration::hours(1));
        queue.enqueue(later).await.unwrap();
        queue.enqueue(job(0, "b")).await.unwrap();

        let report = queue.process_pass().await.unwrap();

        assert_eq!(report.jobs, 1);
        assert_eq!(queue.len().await, 1);
    }
}
