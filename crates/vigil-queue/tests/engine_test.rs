//! End-to-end behavior of the job queue engine on an in-memory store.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use vigil_core::{
    DocumentStore, EventHandler, FailureReason, JobEvent, JobMetadata, JobState, JOBS_COLLECTION,
};
use vigil_queue::{Health, JobError, JobQueueEngine, QueueError, WorkerPoolConfig};
use vigil_testing::{
    init_tracing, real_clock, test_config, MemoryDocumentStore, RecordingEventHandler,
    ScriptedHandler,
};

struct Harness {
    engine: JobQueueEngine,
    store: Arc<MemoryDocumentStore>,
    handler: Arc<ScriptedHandler>,
    events: Arc<RecordingEventHandler>,
}

async fn harness_with(config: WorkerPoolConfig, handler: ScriptedHandler) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryDocumentStore::new());
    let handler = Arc::new(handler);
    let events = Arc::new(RecordingEventHandler::new());

    let document_store: Arc<dyn DocumentStore> = store.clone();
    let event_sink: Arc<dyn EventHandler> = events.clone();
    let engine = JobQueueEngine::with_components(
        document_store,
        handler.clone(),
        event_sink,
        real_clock(),
        config,
    )
    .expect("valid config");
    engine.initialize().await.expect("initialize");

    Harness { engine, store, handler, events }
}

async fn harness() -> Harness {
    harness_with(test_config(), ScriptedHandler::new()).await
}

#[tokio::test]
async fn higher_priority_jobs_run_first() {
    let h = harness().await;
    for (key, priority) in [("low", 1), ("high", 10), ("mid", 5), ("mid-later", 5)] {
        h.engine.queue_job(key, priority, JobMetadata::default()).await.unwrap();
    }

    h.engine.add_worker("w1", 1).await.unwrap();
    h.events.wait_for("completed", 4).await;

    assert_eq!(h.handler.calls().await, ["high", "mid", "mid-later", "low"]);
    h.engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn completed_job_carries_result_and_events() {
    let h = harness().await;
    let job_id = h.engine.queue_job("github", 0, JobMetadata::new("scheduler")).await.unwrap();

    h.engine.add_worker("w1", 2).await.unwrap();
    h.events.wait_for("completed", 1).await;

    let job = h.engine.find_job(job_id).await.unwrap().expect("job exists");
    assert_eq!(job.state, JobState::Completed);
    assert!(job.completed_at.is_some());
    assert_eq!(job.result.as_ref().and_then(|r| r["status"].as_str()), Some("operational"));
    assert_eq!(job.metadata.source, "scheduler");

    let kinds: Vec<_> = h.events.for_job(job_id).await.iter().map(JobEvent::kind).collect();
    assert_eq!(kinds, ["queued", "started", "completed"]);
}

#[tokio::test]
async fn invalid_keys_never_reach_the_store() {
    let h = harness().await;

    for key in ["", "   ", "bad\nkey", &"x".repeat(257)] {
        let result = h.engine.queue_job(key, 0, JobMetadata::default()).await;
        assert!(matches!(result, Err(QueueError::InvalidInput { .. })), "key {key:?}");
    }

    let result = h.engine.queue_batch(&["fine", "", "also-fine"], Some("b1"), 0).await;
    match result {
        Err(QueueError::InvalidInput { message }) => assert!(message.contains("index 1")),
        other => panic!("expected invalid input, got {other:?}"),
    }

    assert_eq!(h.store.len(JOBS_COLLECTION).await, 0);
    assert_eq!(h.events.count("queued").await, 0);
}

#[tokio::test]
async fn empty_batch_is_accepted_even_before_initialize() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
    let engine =
        JobQueueEngine::new(store, Arc::new(ScriptedHandler::new()), test_config()).unwrap();

    let empty: [&str; 0] = [];
    assert_eq!(engine.queue_batch(&empty, None, 0).await.unwrap(), Vec::new());
    assert!(matches!(
        engine.queue_job("github", 0, JobMetadata::default()).await,
        Err(QueueError::NotInitialized)
    ));
}

#[tokio::test]
async fn batch_jobs_carry_batch_metadata() {
    let h = harness().await;
    let ids = h.engine.queue_batch(&["aws", "gcp", "azure"], Some("nightly"), 3).await.unwrap();

    assert_eq!(ids.len(), 3);
    for id in ids {
        let job = h.engine.find_job(id).await.unwrap().unwrap();
        assert_eq!(job.metadata.source, "batch");
        assert_eq!(job.metadata.batch_id.as_deref(), Some("nightly"));
        assert_eq!(job.priority, 3);
        assert_eq!(job.state, JobState::Waiting);
    }
}

#[tokio::test]
async fn retryable_failures_stop_at_max_retries() {
    let config = WorkerPoolConfig { max_retries: 2, ..test_config() };
    let h = harness_with(config, ScriptedHandler::new()).await;
    h.handler.fail_times("flaky", 3, JobError::retryable("upstream 503")).await;

    let job_id = h.engine.queue_job("flaky", 0, JobMetadata::default()).await.unwrap();
    h.engine.add_worker("w1", 1).await.unwrap();
    h.events.wait_for("failed", 1).await;

    let job = h.engine.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error.as_deref(), Some("upstream 503"));
    assert_eq!(h.handler.calls_for("flaky").await, 3);
    assert_eq!(h.events.count("retrying").await, 2);

    match h.events.of_kind("failed").await.as_slice() {
        [JobEvent::Failed { reason, retry_count, .. }] => {
            assert_eq!(*reason, FailureReason::RetriesExhausted);
            assert_eq!(*retry_count, 2);
        },
        other => panic!("unexpected failed events: {other:?}"),
    }
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let h = harness().await;
    h.handler.push("gone", Err(JobError::permanent("provider not found"))).await;

    let job_id = h.engine.queue_job("gone", 0, JobMetadata::default()).await.unwrap();
    h.engine.add_worker("w1", 1).await.unwrap();
    h.events.wait_for("failed", 1).await;

    let job = h.engine.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(h.handler.calls_for("gone").await, 1);
    assert_eq!(h.events.count("retrying").await, 0);
}

#[tokio::test]
async fn pause_rejects_submissions_and_holds_claims() {
    let h = harness().await;
    let job_id = h.engine.queue_job("stripe", 0, JobMetadata::default()).await.unwrap();

    h.engine.pause_queue();
    assert!(h.engine.is_paused());
    assert!(matches!(
        h.engine.queue_job("slack", 0, JobMetadata::default()).await,
        Err(QueueError::ShuttingDown)
    ));

    h.engine.add_worker("w1", 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = h.engine.find_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);

    h.engine.resume_queue();
    h.events.wait_for("completed", 1).await;
    h.engine.queue_job("slack", 0, JobMetadata::default()).await.unwrap();
}

#[tokio::test]
async fn finishing_one_job_reopens_exactly_one_slot() {
    let config = WorkerPoolConfig { max_queue_size: 2, ..test_config() };
    let h = harness_with(config, ScriptedHandler::new()).await;

    let first = h.engine.queue_job("a", 0, JobMetadata::default()).await.unwrap();
    h.engine.queue_job("b", 0, JobMetadata::default()).await.unwrap();
    assert_eq!(
        h.engine.queue_job("c", 0, JobMetadata::default()).await,
        Err(QueueError::QueueFull { current: 2, max: 2 })
    );
    assert!(matches!(
        h.engine.queue_batch(&["c"], None, 0).await,
        Err(QueueError::QueueFull { .. })
    ));

    let mut job = h.engine.find_job(first).await.unwrap().unwrap();
    job.state = JobState::Completed;
    job.completed_at = Some(Utc::now());
    job.result = Some(serde_json::json!({ "status": "operational" }));
    h.store.put(JOBS_COLLECTION, &first.to_string(), job.to_document().unwrap()).await;

    h.engine.queue_job("c", 0, JobMetadata::default()).await.unwrap();
    assert_eq!(
        h.engine.queue_job("d", 0, JobMetadata::default()).await,
        Err(QueueError::QueueFull { current: 2, max: 2 })
    );
}

#[tokio::test]
async fn worker_completions_free_queue_capacity() {
    let config = WorkerPoolConfig { max_queue_size: 2, ..test_config() };
    let h = harness_with(config, ScriptedHandler::new()).await;

    h.engine.queue_batch(&["a", "b"], None, 0).await.unwrap();
    assert!(matches!(
        h.engine.queue_job("c", 0, JobMetadata::default()).await,
        Err(QueueError::QueueFull { .. })
    ));

    h.engine.add_worker("w1", 2).await.unwrap();
    h.events.wait_for("completed", 2).await;

    h.engine.queue_batch(&["c", "d"], None, 0).await.unwrap();
    h.engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn idle_backlog_reports_critical_health() {
    let h = harness().await;
    let keys: Vec<String> = (0..101).map(|i| format!("provider-{i}")).collect();
    h.engine.queue_batch(&keys, Some("bulk"), 0).await.unwrap();

    let status = h.engine.get_status().await.unwrap();
    assert_eq!(status.health, Health::Critical);
    assert_eq!(h.engine.last_metrics().await.map(|m| m.waiting_count), Some(101));
    assert_eq!(status.details.metrics.waiting_count, 101);
    assert_eq!(status.details.metrics.worker_count, 0);
    assert!(!status.details.paused);
}

#[tokio::test]
async fn worker_registry_rules() {
    let h = harness().await;

    h.engine.add_worker("w1", 1).await.unwrap();
    assert!(matches!(
        h.engine.add_worker("w1", 1).await,
        Err(QueueError::WorkerExists { .. })
    ));
    assert!(matches!(h.engine.add_worker("w2", 0).await, Err(QueueError::InvalidInput { .. })));

    h.engine.remove_worker("w1").await.unwrap();
    assert!(matches!(
        h.engine.remove_worker("w1").await,
        Err(QueueError::WorkerNotFound { .. })
    ));
    assert!(h.engine.worker_stats().await.is_empty());
}

#[tokio::test]
async fn graceful_shutdown_lets_active_jobs_finish() {
    let h = harness_with(test_config(), ScriptedHandler::with_delay(Duration::from_millis(150)))
        .await;
    let ids = h.engine.queue_batch(&["a", "b"], None, 0).await.unwrap();

    h.engine.add_worker("w1", 2).await.unwrap();
    h.events.wait_for("started", 2).await;

    h.engine.shutdown(true).await.unwrap();
    assert_eq!(h.handler.max_in_flight(), 2);

    for id in ids {
        assert_eq!(h.engine.find_job(id).await.unwrap().unwrap().state, JobState::Completed);
    }
    assert!(matches!(
        h.engine.queue_job("late", 0, JobMetadata::default()).await,
        Err(QueueError::ShuttingDown)
    ));
    assert!(matches!(h.engine.add_worker("w2", 1).await, Err(QueueError::ShuttingDown)));
    assert!(matches!(h.engine.initialize().await, Err(QueueError::ShuttingDown)));
    h.engine.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn cleanup_removes_only_old_finished_jobs() {
    let h = harness().await;
    h.engine.queue_batch(&["a", "b"], None, 0).await.unwrap();
    let third = h.engine.queue_job("c", 0, JobMetadata::default()).await.unwrap();

    assert_eq!(h.engine.cleanup_finished(Duration::ZERO).await.unwrap(), 0);

    h.engine.add_worker("w1", 3).await.unwrap();
    h.events.wait_for("completed", 3).await;
    h.engine.remove_worker("w1").await.unwrap();

    assert_eq!(h.engine.cleanup_finished(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.cleanup_finished(Duration::from_millis(1)).await.unwrap(), 3);
    assert!(h.engine.find_job(third).await.unwrap().is_none());
}
