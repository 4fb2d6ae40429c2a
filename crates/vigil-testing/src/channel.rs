//! Scripted delivery channel.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use tokio::sync::Mutex;
use vigil_delivery::{
    BatchOutcome, ChannelKind, DeliveryChannel, DeliveryError, DeliveryPayload, Target,
    TargetOutcome, TargetResult,
};

/// One recorded `send_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCall {
    /// Subscription ids in the batch.
    pub subscription_ids: Vec<String>,
    /// Attempt number passed by the queue.
    pub attempt: u32,
}

/// Channel whose per-target outcomes are set by the test.
///
/// Targets without a scripted outcome are delivered.
#[derive(Debug)]
pub struct ScriptedChannel {
    kind: ChannelKind,
    max_batch_size: usize,
    outcomes: Mutex<HashMap<String, TargetOutcome>>,
    failing_calls: AtomicU32,
    delay: Duration,
    calls: Mutex<Vec<ChannelCall>>,
}

impl ScriptedChannel {
    /// Channel of `kind` accepting `max_batch_size` targets per call.
    pub fn new(kind: ChannelKind, max_batch_size: usize) -> Self {
        Self {
            kind,
            max_batch_size,
            outcomes: Mutex::new(HashMap::new()),
            failing_calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps `delay` (wall time) inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the outcome reported for `subscription_id`.
    pub async fn set_outcome(&self, subscription_id: &str, outcome: TargetOutcome) {
        self.outcomes.lock().await.insert(subscription_id.to_string(), outcome);
    }

    /// Reports `subscription_id` as gone.
    pub async fn mark_invalid(&self, subscription_id: &str) {
        self.set_outcome(subscription_id, TargetOutcome::Invalid { reason: "unregistered".into() })
            .await;
    }

    /// Reports `subscription_id` as a retryable failure.
    pub async fn mark_unavailable(&self, subscription_id: &str) {
        self.set_outcome(
            subscription_id,
            TargetOutcome::Failed { error: "503 Service Unavailable".into(), retryable: true },
        )
        .await;
    }

    /// Clears every scripted outcome.
    pub async fn heal(&self) {
        self.outcomes.lock().await.clear();
        self.failing_calls.store(0, Ordering::SeqCst);
    }

    /// Fails the next `count` calls as a whole with a network error.
    pub fn fail_calls(&self, count: u32) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Calls received so far.
    pub async fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().await.clone()
    }

    /// Times `subscription_id` was sent to.
    pub async fn sends_to(&self, subscription_id: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.subscription_ids.iter().any(|id| id == subscription_id))
            .count()
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for ScriptedChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn send_batch(
        &self,
        targets: &[Target],
        _payload: &DeliveryPayload,
        attempt: u32,
    ) -> vigil_delivery::Result<BatchOutcome> {
        self.calls.lock().await.push(ChannelCall {
            subscription_ids: targets.iter().map(|t| t.subscription_id.clone()).collect(),
            attempt,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::network("connection refused"));
        }

        let outcomes = self.outcomes.lock().await;
        let results = targets
            .iter()
            .map(|target| {
                let outcome = outcomes
                    .get(&target.subscription_id)
                    .cloned()
                    .unwrap_or(TargetOutcome::Delivered);
                TargetResult::new(target, outcome)
            })
            .collect();
        Ok(BatchOutcome::from_results(results))
    }
}
