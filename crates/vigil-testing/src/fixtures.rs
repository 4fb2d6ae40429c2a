//! Fixture builders.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use vigil_delivery::{
    ChannelKind, DeliveryPayload, MemorySubscriptionRegistry, Subscription, Target,
};
use vigil_queue::WorkerPoolConfig;

/// Engine configuration with intervals short enough for wall-clock tests.
pub fn test_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        poll_interval: Duration::from_millis(10),
        sub_batch_pause: Duration::ZERO,
        backoff_base_delay: Duration::from_millis(1),
        backoff_max_delay: Duration::from_millis(10),
        reaper_interval: Duration::from_millis(50),
        metrics_interval: Duration::from_millis(50),
        shutdown_wait: Duration::from_secs(2),
        rate_limit_per_second: 10_000.0,
        backpressure_max_delay: Duration::from_millis(20),
        ..WorkerPoolConfig::default()
    }
}

/// Status-change payload for `provider_id`.
pub fn status_payload(provider_id: &str, status: &str) -> DeliveryPayload {
    DeliveryPayload {
        event_type: "provider.status_changed".to_string(),
        provider_id: provider_id.to_string(),
        status: status.to_string(),
        message: Some(format!("{provider_id} is {status}")),
        occurred_at: Utc::now(),
        data: json!({ "previous_status": "operational" }),
    }
}

/// Registry holding `count` active subscriptions on `channel`, named
/// `sub-0000`, `sub-0001`, ...; returns the registry and their targets.
pub async fn registry_with_subscriptions(
    channel: ChannelKind,
    count: usize,
) -> (MemorySubscriptionRegistry, Vec<Target>) {
    let registry = MemorySubscriptionRegistry::new();
    let mut targets = Vec::with_capacity(count);
    for i in 0..count {
        let subscription = Subscription::new(format!("sub-{i:04}"), channel, format!("addr-{i:04}"));
        targets.push(subscription.target());
        registry.insert(subscription).await;
    }
    (registry, targets)
}
