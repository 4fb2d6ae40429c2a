//! Scripted job handler.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use vigil_core::Job;
use vigil_queue::{JobError, JobHandler};

/// Handler whose result per payload key is scripted by the test.
///
/// Keys without a script succeed with `{"status": "operational"}`. Each
/// scripted result is consumed once, in order; when a key's script runs
/// out the default applies again.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, JobError>>>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedHandler {
    /// Handler that succeeds immediately for every key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that sleeps `delay` (wall time) before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    /// Appends a result to the script of `key`.
    pub async fn push(&self, key: &str, result: Result<Value, JobError>) {
        self.scripts.lock().await.entry(key.to_string()).or_default().push_back(result);
    }

    /// Makes `key` fail `times` times with `error`.
    pub async fn fail_times(&self, key: &str, times: usize, error: JobError) {
        let mut scripts = self.scripts.lock().await;
        let script = scripts.entry(key.to_string()).or_default();
        script.extend(std::iter::repeat(Err(error)).take(times));
    }

    /// Keys handled so far, in call order.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Times `key` was handled.
    pub async fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().await.iter().filter(|k| k.as_str() == key).count()
    }

    /// Highest number of concurrent `handle` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.calls.lock().await.push(job.payload_key.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .await
            .get_mut(&job.payload_key)
            .and_then(VecDeque::pop_front);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| Ok(json!({ "provider": job.payload_key, "status": "operational" })))
    }
}
