//! Channel adapter boundary.
//!
//! A channel delivers one payload to many targets in a single call and
//! reports an outcome per target, so the queue can retry only the targets
//! that failed and remove only the ones that are gone for good.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    models::{ChannelKind, DeliveryPayload, Target},
};

/// What happened to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Accepted by the recipient.
    Delivered,
    /// Recipient no longer exists; its subscription should be removed.
    Invalid {
        /// Why the recipient was rejected.
        reason: String,
    },
    /// Delivery failed.
    Failed {
        /// Failure description.
        error: String,
        /// Whether a later attempt could succeed.
        retryable: bool,
    },
}

/// Outcome for one target of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Subscription of the target.
    pub subscription_id: String,
    /// Result.
    pub outcome: TargetOutcome,
}

impl TargetResult {
    /// Result for `target`.
    pub fn new(target: &Target, outcome: TargetOutcome) -> Self {
        Self { subscription_id: target.subscription_id.clone(), outcome }
    }
}

/// Result of one `send_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Targets delivered.
    pub success_count: usize,
    /// Targets not delivered, invalid ones included.
    pub failure_count: usize,
    /// One entry per target.
    pub results: Vec<TargetResult>,
}

impl BatchOutcome {
    /// Builds an outcome, deriving the counts from `results`.
    pub fn from_results(results: Vec<TargetResult>) -> Self {
        let success_count =
            results.iter().filter(|r| r.outcome == TargetOutcome::Delivered).count();
        Self { success_count, failure_count: results.len() - success_count, results }
    }

    /// Outcome where every target failed the same way.
    pub fn all_failed(targets: &[Target], error: &str, retryable: bool) -> Self {
        Self::from_results(
            targets
                .iter()
                .map(|target| {
                    TargetResult::new(
                        target,
                        TargetOutcome::Failed { error: error.to_string(), retryable },
                    )
                })
                .collect(),
        )
    }

    /// Outcomes keyed by subscription id.
    pub fn by_subscription(&self) -> HashMap<&str, &TargetOutcome> {
        self.results.iter().map(|r| (r.subscription_id.as_str(), &r.outcome)).collect()
    }

    /// Whether every target failed in a way worth retrying.
    ///
    /// Used to decide if the channel itself looks unhealthy.
    pub fn all_retryable_failures(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| matches!(r.outcome, TargetOutcome::Failed { retryable: true, .. }))
    }
}

/// Transport adapter for one channel kind.
#[async_trait::async_trait]
pub trait DeliveryChannel: Send + Sync + std::fmt::Debug {
    /// Channel this adapter serves.
    fn kind(&self) -> ChannelKind;

    /// Most targets accepted by one `send_batch` call.
    fn max_batch_size(&self) -> usize;

    /// Delivers `payload` to every target.
    ///
    /// `attempt` is the job's retry count, forwarded to recipients.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call as a whole failed; every target
    /// is then treated as a retryable failure.
    async fn send_batch(
        &self,
        targets: &[Target],
        payload: &DeliveryPayload,
        attempt: u32,
    ) -> Result<BatchOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str) -> Target {
        Target::new(id, ChannelKind::Push, format!("token-{id}"))
    }

    #[test]
    fn counts_are_derived_from_results() {
        let outcome = BatchOutcome::from_results(vec![
            TargetResult::new(&target("a"), TargetOutcome::Delivered),
            TargetResult::new(&target("b"), TargetOutcome::Invalid { reason: "gone".into() }),
            TargetResult::new(
                &target("c"),
                TargetOutcome::Failed { error: "503".into(), retryable: true },
            ),
        ]);

        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.failure_count, 2);
        assert!(!outcome.all_retryable_failures());
        assert_eq!(outcome.by_subscription()["a"], &TargetOutcome::Delivered);
    }

    #[test]
    fn all_failed_marks_every_target() {
        let targets = [target("a"), target("b")];
        let outcome = BatchOutcome::all_failed(&targets, "connection refused", true);

        assert_eq!(outcome.failure_count, 2);
        assert!(outcome.all_retryable_failures());
        assert!(!BatchOutcome::default().all_retryable_failures());
    }
}
