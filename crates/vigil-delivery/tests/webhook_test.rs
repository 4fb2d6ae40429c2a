//! Webhook channel against a mock HTTP server.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use vigil_core::RealClock;
use vigil_delivery::{
    verify_signature, webhook, ChannelKind, DeliveryChannel, DeliveryConfig, DeliveryJob,
    DeliveryQueue, MemorySubscriptionRegistry, Subscription, SubscriptionRegistry, Target,
    TargetOutcome, WebhookChannel, WebhookConfig,
};
use vigil_testing::{init_tracing, status_payload};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn channel() -> WebhookChannel {
    WebhookChannel::new(WebhookConfig { timeout: Duration::from_millis(500), ..Default::default() })
        .unwrap()
}

fn target(id: &str, url: String) -> Target {
    Target::new(id, ChannelKind::Webhook, url)
}

#[tokio::test]
async fn signed_request_carries_delivery_headers() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/status"))
        .and(header("content-type", "application/json"))
        .and(header(webhook::EVENT_HEADER, "provider.status_changed"))
        .and(header(webhook::RETRY_COUNT_HEADER, "2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let payload = status_payload("github", "major_outage");
    let target = target("s1", format!("{}/hooks/status", server.uri())).with_secret("whsec_abc");
    let outcome = channel().send_batch(&[target], &payload, 2).await.unwrap();

    assert_eq!(outcome.success_count, 1);
    assert_eq!(outcome.by_subscription()["s1"], &TargetOutcome::Delivered);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request.headers.get(webhook::SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(&request.body, signature, "whsec_abc"));
    assert!(!verify_signature(&request.body, signature, "wrong-secret"));
    assert!(request.headers.get(webhook::DELIVERY_ID_HEADER).is_some());
    assert!(request.headers.get(webhook::TIMESTAMP_HEADER).is_some());

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["provider_id"], "github");
    assert_eq!(body["status"], "major_outage");
}

#[tokio::test]
async fn unsigned_target_gets_no_signature_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

    let payload = status_payload("slack", "operational");
    channel().send_batch(&[target("s1", server.uri())], &payload, 0).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get(webhook::SIGNATURE_HEADER).is_none());
}

#[tokio::test]
async fn responses_map_to_target_outcomes() {
    init_tracing();
    let server = MockServer::start().await;
    for (route, status) in [("/ok", 200), ("/gone", 410), ("/missing", 404), ("/busy", 503), ("/bad", 400)]
    {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }

    let targets: Vec<_> = ["ok", "gone", "missing", "busy", "bad"]
        .into_iter()
        .map(|name| target(name, format!("{}/{name}", server.uri())))
        .chain([
            target("refused", "http://127.0.0.1:9/hook".to_string()),
            target("malformed", "not a url".to_string()),
        ])
        .collect();

    let outcome = channel()
        .send_batch(&targets, &status_payload("aws", "degraded"), 0)
        .await
        .unwrap();
    let by_id = outcome.by_subscription();

    assert_eq!(outcome.results.len(), 7);
    assert_eq!(by_id["ok"], &TargetOutcome::Delivered);
    assert!(matches!(by_id["gone"], TargetOutcome::Invalid { .. }));
    assert!(matches!(by_id["missing"], TargetOutcome::Invalid { .. }));
    assert!(matches!(by_id["busy"], TargetOutcome::Failed { retryable: true, .. }));
    assert!(matches!(by_id["bad"], TargetOutcome::Failed { retryable: false, .. }));
    assert!(matches!(by_id["refused"], TargetOutcome::Failed { retryable: true, .. }));
    assert!(matches!(by_id["malformed"], TargetOutcome::Invalid { .. }));
    assert_eq!(outcome.success_count, 1);
}

#[tokio::test]
async fn slow_endpoint_times_out_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let outcome = channel()
        .send_batch(&[target("slow", server.uri())], &status_payload("gcp", "degraded"), 0)
        .await
        .unwrap();

    assert!(matches!(
        outcome.by_subscription()["slow"],
        TargetOutcome::Failed { retryable: true, .. }
    ));
}

#[tokio::test]
async fn queue_removes_webhooks_that_answer_gone() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/live"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/dead"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let registry = Arc::new(MemorySubscriptionRegistry::new());
    let live = Subscription::new("live", ChannelKind::Webhook, format!("{}/live", server.uri()))
        .with_secret("s3cret");
    let dead = Subscription::new("dead", ChannelKind::Webhook, format!("{}/dead", server.uri()));
    let targets = vec![live.target(), dead.target()];
    registry.insert(live).await;
    registry.insert(dead).await;

    let shared: Arc<dyn SubscriptionRegistry> = registry.clone();
    let queue = DeliveryQueue::new(DeliveryConfig::default(), shared, Arc::new(RealClock::new()))
        .unwrap()
        .with_channel(Arc::new(channel()));

    queue
        .enqueue(DeliveryJob::new(targets, status_payload("github", "operational"), 0, Utc::now()))
        .await
        .unwrap();
    let report = queue.process_pass().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.invalid_removed, 1);
    assert!(registry.get("dead").await.is_none());
    assert!(registry.get("live").await.is_some());
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn batch_send_runs_on_a_spawned_task_in_target_order() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let channel: Arc<dyn DeliveryChannel> = Arc::new(
        WebhookChannel::new(WebhookConfig { max_concurrency: 4, ..Default::default() }).unwrap(),
    );
    let targets: Vec<_> = (0..10)
        .map(|i| target(&format!("hook-{i}"), format!("{}/hook/{i}", server.uri())))
        .collect();

    let outcome = tokio::spawn(async move {
        channel.send_batch(&targets, &status_payload("github", "degraded"), 1).await
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.success_count, 10);
    let ids: Vec<_> = outcome.results.iter().map(|r| r.subscription_id.as_str()).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("hook-{i}")).collect();
    assert_eq!(ids, expected);
}
