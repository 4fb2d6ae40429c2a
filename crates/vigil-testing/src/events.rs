//! Event recording for assertions on the engine's lifecycle events.

use std::time::Duration;

use tokio::sync::Mutex;
use vigil_core::{EventHandler, JobEvent, JobId};

/// Default deadline of the `wait_for_*` helpers.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in arrival order.
    pub async fn events(&self) -> Vec<JobEvent> {
        self.events.lock().await.clone()
    }

    /// Events of one kind (`JobEvent::kind`).
    pub async fn of_kind(&self, kind: &str) -> Vec<JobEvent> {
        self.events.lock().await.iter().filter(|e| e.kind() == kind).cloned().collect()
    }

    /// Number of events of one kind.
    pub async fn count(&self, kind: &str) -> usize {
        self.events.lock().await.iter().filter(|e| e.kind() == kind).count()
    }

    /// Events about one job.
    pub async fn for_job(&self, job_id: JobId) -> Vec<JobEvent> {
        self.events.lock().await.iter().filter(|e| e.job_id() == job_id).cloned().collect()
    }

    /// Waits until at least `count` events of `kind` arrived.
    ///
    /// # Panics
    ///
    /// Panics after `DEFAULT_EVENT_TIMEOUT` so a stuck test fails instead of
    /// hanging.
    pub async fn wait_for(&self, kind: &str, count: usize) {
        let waited = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            while self.count(kind).await < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        if waited.is_err() {
            panic!(
                "expected {count} '{kind}' events within {DEFAULT_EVENT_TIMEOUT:?}, got {}",
                self.count(kind).await
            );
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: JobEvent) {
        self.events.lock().await.push(event);
    }
}
