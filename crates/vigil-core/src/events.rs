//! Job lifecycle events and subscriber traits.
//!
//! The engine reports asynchronous outcomes (queued, started, completed,
//! retrying, failed, stalled-reclaimed) through `EventHandler`. Submitters
//! only see rejection errors synchronously; everything else is observable
//! here and through metrics.
//!
//! ```text
//! ┌──────────────┐   JobEvent    ┌────────────────────┐
//! │ Engine /     │ ────────────▶ │ MulticastHandler   │
//! │ Worker/Reaper│               └────────────────────┘
//! └──────────────┘                  │            │
//!                                   ▼            ▼
//!                          status notifier   audit log
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobId;

/// Events emitted by the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was accepted into the store.
    Queued {
        /// Job identifier.
        job_id: JobId,
        /// Work key of the job.
        payload_key: String,
        /// Scheduling priority.
        priority: i32,
        /// Batch the job belongs to.
        batch_id: Option<String>,
        /// Acceptance time.
        at: DateTime<Utc>,
    },

    /// A worker claimed the job.
    Started {
        /// Job identifier.
        job_id: JobId,
        /// Claiming worker.
        worker_id: String,
        /// Attempt number (1-based).
        attempt: u32,
        /// Claim time.
        at: DateTime<Utc>,
    },

    /// The job finished successfully.
    Completed {
        /// Job identifier.
        job_id: JobId,
        /// Worker that ran the job.
        worker_id: String,
        /// Handler run time in milliseconds.
        duration_ms: u64,
        /// Completion time.
        at: DateTime<Utc>,
    },

    /// A failed attempt was requeued.
    Retrying {
        /// Job identifier.
        job_id: JobId,
        /// Retry count after the requeue.
        retry_count: u32,
        /// Error of the failed attempt.
        error: String,
        /// Requeue time.
        at: DateTime<Utc>,
    },

    /// The job failed permanently.
    Failed {
        /// Job identifier.
        job_id: JobId,
        /// Final retry count.
        retry_count: u32,
        /// Why the job will not run again.
        reason: FailureReason,
        /// Error recorded on the job.
        error: String,
        /// Failure time.
        at: DateTime<Utc>,
    },

    /// The reaper returned a stalled job to the waiting state.
    StalledReclaimed {
        /// Job identifier.
        job_id: JobId,
        /// Retry count after reclamation.
        retry_count: u32,
        /// Stall reclamations so far.
        stalled_count: u32,
        /// Reclamation time.
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Job the event refers to.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::StalledReclaimed { job_id, .. } => *job_id,
        }
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::StalledReclaimed { .. } => "stalled_reclaimed",
        }
    }
}

/// Why a job reached the terminal `failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Handler reported a non-retryable error.
    Permanent,
    /// Retry ceiling reached.
    RetriesExhausted,
    /// Stall ceiling or retry ceiling reached while reclaiming.
    Stalled,
}

/// Subscriber for job lifecycle events.
///
/// Handlers must not block job processing. Failures inside a handler are
/// logged by the handler itself and never propagate back to the engine.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one lifecycle event.
    async fn handle_event(&self, event: JobEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: JobEvent) {}
}

/// Fans each event out to every registered subscriber.
#[derive(Debug)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MulticastEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: JobEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
