//! Property-based tests for scheduling and classification invariants.
//!
//! Async components run on a current-thread runtime driven by a `TestClock`,
//! so every case is deterministic.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use vigil_core::{Clock, TestClock};
use vigil_delivery::{
    ChannelKind, DeliveryConfig, DeliveryJob, DeliveryQueue, MemorySubscriptionRegistry,
    SubscriptionRegistry, Target,
};
use vigil_queue::{CircuitBreaker, CircuitConfig, CircuitState, Health, JobError, StateCounts};
use vigil_testing::status_payload;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}

fn counts_strategy() -> impl Strategy<Value = StateCounts> {
    (0usize..300, 0usize..5, 0usize..1_000, 0usize..200).prop_map(
        |(waiting, active, completed, failed)| StateCounts { waiting, active, completed, failed },
    )
}

const PERMANENT_PATTERNS: [&str; 7] = [
    "permission denied",
    "unauthorized",
    "forbidden",
    "malformed",
    "invalid",
    "not found",
    "unsupported",
];

proptest! {
    #![proptest_config(proptest_config())]

    /// Delivery jobs pop by descending priority, first-in-first-out within a
    /// priority band.
    #[test]
    fn delivery_queue_pops_by_priority_then_arrival(
        priorities in prop::collection::vec(-3i32..4, 1..40)
    ) {
        let order = runtime().block_on(async {
            let registry: Arc<dyn SubscriptionRegistry> =
                Arc::new(MemorySubscriptionRegistry::new());
            let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
            let queue = DeliveryQueue::new(
                DeliveryConfig { max_queue_size: 100, ..DeliveryConfig::default() },
                registry,
                clock,
            )
            .unwrap();

            for (index, priority) in priorities.iter().enumerate() {
                let target = Target::new("sub", ChannelKind::Webhook, "https://example.com");
                let payload = status_payload(&index.to_string(), "degraded");
                queue.enqueue(DeliveryJob::new(vec![target], payload, *priority, Utc::now()))
                    .await
                    .unwrap();
            }

            queue
                .snapshot()
                .await
                .into_iter()
                .map(|job| (job.priority, job.payload.provider_id.parse::<usize>().unwrap()))
                .collect::<Vec<_>>()
        });

        prop_assert_eq!(order.len(), priorities.len());
        for pair in order.windows(2) {
            let ((p1, i1), (p2, i2)) = (pair[0], pair[1]);
            prop_assert!(p1 > p2 || (p1 == p2 && i1 < i2), "out of order: {:?}", pair);
        }
    }

    /// Fewer consecutive failures than the threshold never open the circuit,
    /// and reaching it always does.
    #[test]
    fn circuit_opens_exactly_at_threshold(threshold in 1u32..10, extra_successes in 0u32..5) {
        let (before, after) = runtime().block_on(async {
            let breaker = CircuitBreaker::new(
                "store",
                CircuitConfig { failure_threshold: threshold, open_timeout: Duration::from_secs(30) },
                Arc::new(TestClock::new()),
            );

            for _ in 0..extra_successes {
                breaker.record_success().await;
            }
            for _ in 0..threshold - 1 {
                breaker.record_failure().await;
            }
            let before = breaker.state().await;
            breaker.record_failure().await;
            (before, breaker.state().await)
        });

        prop_assert_eq!(before, CircuitState::Closed);
        prop_assert_eq!(after, CircuitState::Open);
    }

    /// Health classification follows the backlog and failure-ratio rules.
    #[test]
    fn health_classification_rules(counts in counts_strategy()) {
        let health = Health::classify(&counts);
        let backlog_unattended = counts.active == 0 && counts.waiting > 100;
        let failing = counts.failed as f64 > 0.1 * counts.completed as f64;

        match health {
            Health::Critical => prop_assert!(backlog_unattended),
            Health::Degraded => prop_assert!(!backlog_unattended && failing),
            Health::Healthy => prop_assert!(!backlog_unattended && !failing),
        }
    }

    /// Handler messages containing a permanent-failure pattern are never
    /// retried, whatever the surrounding text or letter case.
    #[test]
    fn permanent_patterns_are_never_retryable(
        prefix in "[a-z0-9 ]{0,20}",
        suffix in "[a-z0-9 ]{0,20}",
        pattern in prop::sample::select(PERMANENT_PATTERNS.to_vec()),
        uppercase in any::<bool>(),
    ) {
        let pattern = if uppercase { pattern.to_uppercase() } else { pattern.to_string() };
        let error = JobError::from_message(format!("{prefix}{pattern}{suffix}"));
        prop_assert!(!error.retryable);
    }
}
