//! Delivery queue behavior against scripted channels.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use vigil_core::{Clock, TestClock};
use vigil_delivery::{
    ChannelKind, DeliveryConfig, DeliveryError, DeliveryJob, DeliveryQueue,
    MemorySubscriptionRegistry, Subscription, SubscriptionRegistry, Target,
};
use vigil_queue::CircuitState;
use vigil_testing::{
    init_tracing, real_clock, registry_with_subscriptions, status_payload, ScriptedChannel,
};

fn job(targets: Vec<Target>) -> DeliveryJob {
    DeliveryJob::new(targets, status_payload("github", "major_outage"), 0, Utc::now())
}

fn delivery_queue(
    config: DeliveryConfig,
    registry: Arc<MemorySubscriptionRegistry>,
    clock: &TestClock,
    channels: &[Arc<ScriptedChannel>],
) -> DeliveryQueue {
    let registry: Arc<dyn SubscriptionRegistry> = registry;
    let mut queue = DeliveryQueue::new(config, registry, Arc::new(clock.clone())).unwrap();
    for channel in channels {
        queue = queue.with_channel(channel.clone());
    }
    queue
}

#[tokio::test]
async fn only_invalid_subscriptions_are_removed_from_a_large_fanout() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 500).await;
    let registry = Arc::new(registry);
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 100));
    let clock = TestClock::new();

    let invalid: Vec<String> = (0..10).map(|i| format!("sub-{:04}", i * 37)).collect();
    for id in &invalid {
        channel.mark_invalid(id).await;
    }
    for id in ["sub-0001", "sub-0002", "sub-0003", "sub-0004", "sub-0005"] {
        channel.mark_unavailable(id).await;
    }

    let queue = delivery_queue(DeliveryConfig::default(), registry.clone(), &clock, &[channel.clone()]);
    queue.enqueue(job(targets)).await.unwrap();

    let report = queue.process_pass().await.unwrap();

    assert_eq!(channel.calls().await.len(), 5, "500 targets in chunks of 100");
    assert_eq!(report.invalid_removed, 10);
    assert_eq!(report.delivered, 485);
    assert_eq!(report.requeued, 1);
    assert_eq!(registry.len().await, 490);
    for id in &invalid {
        assert!(registry.get(id).await.is_none(), "{id} should be removed");
    }
    for id in ["sub-0001", "sub-0499"] {
        assert!(registry.is_active(id).await.unwrap());
    }

    let queued = queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    let retry = &queued[0];
    let mut retry_ids: Vec<_> = retry.targets.iter().map(|t| t.subscription_id.as_str()).collect();
    retry_ids.sort_unstable();
    assert_eq!(retry_ids, ["sub-0001", "sub-0002", "sub-0003", "sub-0004", "sub-0005"]);
    assert_eq!(retry.retry_count, 1);
    assert_eq!(retry.priority, -1);
    assert_eq!(retry.not_before, Some(clock.now_utc() + chrono::Duration::seconds(1)));
    assert_eq!(registry.get("sub-0001").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn retries_back_off_exponentially_then_drop() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 1).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 10));
    channel.mark_unavailable("sub-0000").await;
    let clock = TestClock::new();
    let config = DeliveryConfig { max_retries: 2, ..Default::default() };
    let queue = delivery_queue(config, Arc::new(registry), &clock, &[channel.clone()]);

    queue.enqueue(job(targets)).await.unwrap();
    assert_eq!(queue.process_pass().await.unwrap().requeued, 1);

    assert_eq!(queue.process_pass().await.unwrap().jobs, 0, "not due yet");
    clock.advance(Duration::from_millis(999));
    assert_eq!(queue.process_pass().await.unwrap().jobs, 0);
    clock.advance(Duration::from_millis(1));
    assert_eq!(queue.process_pass().await.unwrap().requeued, 1);

    clock.advance(Duration::from_secs(1));
    assert_eq!(queue.process_pass().await.unwrap().jobs, 0, "second backoff is 2s");
    clock.advance(Duration::from_secs(1));
    let last = queue.process_pass().await.unwrap();
    assert_eq!(last.dropped, 1);
    assert_eq!(last.requeued, 0);

    assert!(queue.is_empty().await);
    let attempts: Vec<_> = channel.calls().await.iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, [0, 1, 2]);
    assert_eq!(queue.stats().await.dropped, 1);
}

#[tokio::test]
async fn repeatedly_failing_subscription_is_disabled() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 1).await;
    let registry = Arc::new(registry);
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 10));
    channel.mark_unavailable("sub-0000").await;
    let clock = TestClock::new();
    let config = DeliveryConfig { disable_after_failures: 3, max_retries: 10, ..Default::default() };
    let queue = delivery_queue(config, registry.clone(), &clock, &[channel.clone()]);

    queue.enqueue(job(targets)).await.unwrap();
    for _ in 0..3 {
        queue.process_pass().await.unwrap();
        clock.advance(Duration::from_secs(3600));
    }

    let subscription = registry.get("sub-0000").await.unwrap();
    assert!(!subscription.active);
    assert_eq!(subscription.failure_count, 3);
    assert_eq!(queue.stats().await.disabled, 1);

    let report = queue.process_pass().await.unwrap();
    assert_eq!(report.skipped_inactive, 1);
    assert_eq!(channel.sends_to("sub-0000").await, 3);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn success_resets_failure_count() {
    let registry = Arc::new(MemorySubscriptionRegistry::new());
    let subscription = Subscription::new("s1", ChannelKind::Email, "ops@example.com");
    let target = subscription.target();
    registry.insert(subscription).await;

    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Email, 10));
    channel.mark_unavailable("s1").await;
    let clock = TestClock::new();
    let queue = delivery_queue(DeliveryConfig::default(), registry.clone(), &clock, &[channel.clone()]);

    queue.enqueue(job(vec![target])).await.unwrap();
    queue.process_pass().await.unwrap();
    assert_eq!(registry.get("s1").await.unwrap().failure_count, 1);

    channel.heal().await;
    clock.advance(Duration::from_secs(1));
    let report = queue.process_pass().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(registry.get("s1").await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn open_channel_breaker_defers_without_spending_retries() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Webhook, 3).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Webhook, 10));
    channel.fail_calls(1);
    let clock = TestClock::new();
    let config = DeliveryConfig {
        circuit_breaker_threshold: 1,
        circuit_breaker_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let queue = delivery_queue(config, Arc::new(registry), &clock, &[channel.clone()]);

    queue.enqueue(job(targets)).await.unwrap();
    let first = queue.process_pass().await.unwrap();
    assert_eq!(first.requeued, 1);
    assert_eq!(queue.channel_state(ChannelKind::Webhook).await, Some(CircuitState::Open));

    clock.advance(Duration::from_secs(1));
    let deferred = queue.process_pass().await.unwrap();
    assert_eq!(deferred.deferred, 3);
    assert_eq!(deferred.requeued, 0);
    assert_eq!(channel.calls().await.len(), 1, "open breaker must not call the channel");
    assert_eq!(queue.snapshot().await[0].retry_count, 1);

    clock.advance(Duration::from_secs(60));
    let recovered = queue.process_pass().await.unwrap();
    assert_eq!(recovered.delivered, 3);
    assert_eq!(queue.channel_state(ChannelKind::Webhook).await, Some(CircuitState::Closed));
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn operator_can_hold_a_channel_open() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Webhook, 2).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Webhook, 10));
    let clock = TestClock::new();
    let queue =
        delivery_queue(DeliveryConfig::default(), Arc::new(registry), &clock, &[channel.clone()]);
    let breaker = queue.channel_breaker(ChannelKind::Webhook).unwrap().clone();
    assert!(queue.channel_breaker(ChannelKind::Email).is_none());

    breaker.force_state(CircuitState::Open).await;
    queue.enqueue(job(targets)).await.unwrap();
    let held = queue.process_pass().await.unwrap();
    assert_eq!(held.deferred, 2);
    assert!(channel.calls().await.is_empty());

    breaker.force_state(CircuitState::Closed).await;
    let released = queue.process_pass().await.unwrap();
    assert_eq!(released.delivered, 2);
    assert_eq!(queue.snapshot().await.len(), 0);
}

#[tokio::test]
async fn pass_deadline_keeps_confirmed_targets_delivered() {
    init_tracing();
    let registry = Arc::new(MemorySubscriptionRegistry::new());
    let push = Subscription::new("push-1", ChannelKind::Push, "device-token");
    let email = Subscription::new("email-1", ChannelKind::Email, "ops@example.com");
    let targets = vec![push.target(), email.target()];
    registry.insert(push).await;
    registry.insert(email).await;

    let fast = Arc::new(ScriptedChannel::new(ChannelKind::Push, 10));
    let slow = Arc::new(
        ScriptedChannel::new(ChannelKind::Email, 10).with_delay(Duration::from_millis(500)),
    );
    let clock = TestClock::new();
    let config = DeliveryConfig { pass_timeout: Duration::from_millis(100), ..Default::default() };
    let queue = delivery_queue(config, registry, &clock, &[fast.clone(), slow.clone()]);

    queue.enqueue(job(targets)).await.unwrap();
    let report = queue.process_pass().await.unwrap();

    assert!(report.timed_out);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 1);

    let queued = queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);
    let remaining: Vec<_> = queued[0].targets.iter().map(|t| t.subscription_id.as_str()).collect();
    assert_eq!(remaining, ["email-1"]);

    queue.process_pass().await.unwrap();
    assert_eq!(fast.sends_to("push-1").await, 1, "confirmed target is never resent");
    assert_eq!(queue.stats().await.timed_out_passes, 2);
}

#[tokio::test]
async fn higher_priority_jobs_are_sent_first() {
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 3).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 10));
    let clock = TestClock::new();
    let config = DeliveryConfig { batch_size: 1, max_concurrent_batches: 1, ..Default::default() };
    let queue = delivery_queue(config, Arc::new(registry), &clock, &[channel.clone()]);

    for (target, priority) in targets.into_iter().zip([1, 9, 5]) {
        let mut job = job(vec![target]);
        job.priority = priority;
        queue.enqueue(job).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(queue.process_pass().await.unwrap().jobs, 1);
    }

    let order: Vec<_> =
        channel.calls().await.into_iter().flat_map(|c| c.subscription_ids).collect();
    assert_eq!(order, ["sub-0001", "sub-0002", "sub-0000"]);
}

#[tokio::test]
async fn missing_channel_adapter_fails_targets() {
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Email, 2).await;
    let clock = TestClock::new();
    let queue = delivery_queue(DeliveryConfig::default(), Arc::new(registry), &clock, &[]);

    queue.enqueue(job(targets)).await.unwrap();
    let report = queue.process_pass().await.unwrap();

    assert_eq!(report.failed, 2);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn background_loop_delivers_until_stopped() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 20).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 5));
    let registry: Arc<dyn SubscriptionRegistry> = Arc::new(registry);
    let config =
        DeliveryConfig { process_interval: Duration::from_millis(10), ..Default::default() };
    let queue = Arc::new(
        DeliveryQueue::new(config, registry, real_clock()).unwrap().with_channel(channel.clone()),
    );

    queue.start().await.unwrap();
    queue.start().await.unwrap();
    queue.enqueue(job(targets)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.stats().await.delivered < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all targets delivered");

    queue.stop().await;
    assert_eq!(queue.enqueue(job(Vec::new())).await, Err(DeliveryError::Stopped));
    assert!(matches!(queue.start().await, Err(DeliveryError::Stopped)));
}

#[tokio::test]
async fn rate_limit_wait_past_the_deadline_defers_targets() {
    init_tracing();
    let (registry, targets) = registry_with_subscriptions(ChannelKind::Push, 2).await;
    let channel = Arc::new(ScriptedChannel::new(ChannelKind::Push, 1));
    let clock = TestClock::new();
    let config = DeliveryConfig {
        max_concurrent_batches: 1,
        rate_limit_per_second: 1.0,
        pass_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let queue = delivery_queue(config, Arc::new(registry), &clock, &[channel.clone()]);

    queue.enqueue(job(targets)).await.unwrap();
    let report = queue.process_pass().await.unwrap();

    assert!(report.timed_out);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(channel.calls().await.len(), 1);
    assert!(clock.elapsed() >= Duration::from_millis(100));

    let queued = queue.snapshot().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);
}
