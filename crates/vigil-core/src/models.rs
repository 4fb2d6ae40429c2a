//! Job document model and strongly-typed identifiers.
//!
//! A `Job` is one unit of work (typically a provider status check) persisted
//! as a JSON document. Timestamps are serialized as epoch milliseconds so the
//! store can answer range queries such as "active and started before T" with
//! plain numeric comparisons.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    store::Document,
};

/// Collection that holds job documents.
pub const JOBS_COLLECTION: &str = "jobs";

/// Document field names used in store filters and updates.
pub mod fields {
    /// Job identifier.
    pub const ID: &str = "id";
    /// Lifecycle state.
    pub const STATE: &str = "state";
    /// Scheduling priority.
    pub const PRIORITY: &str = "priority";
    /// Submission timestamp (epoch millis).
    pub const CREATED_AT: &str = "created_at";
    /// Submission order tiebreaker.
    pub const SEQUENCE: &str = "sequence";
    /// Claim timestamp (epoch millis).
    pub const STARTED_AT: &str = "started_at";
    /// Completion timestamp (epoch millis).
    pub const COMPLETED_AT: &str = "completed_at";
    /// Terminal failure timestamp (epoch millis).
    pub const FAILED_AT: &str = "failed_at";
    /// Worker currently owning the job.
    pub const WORKER_ID: &str = "worker_id";
    /// Number of requeues so far.
    pub const RETRY_COUNT: &str = "retry_count";
    /// Number of stall reclamations so far.
    pub const STALLED_COUNT: &str = "stalled_count";
    /// Handler output on success.
    pub const RESULT: &str = "result";
    /// Terminal error message.
    pub const ERROR: &str = "error";
    /// Most recent non-terminal error message.
    pub const LAST_ERROR: &str = "last_error";
}

/// Strongly-typed job identifier.
///
/// Wraps a UUID so job ids cannot be confused with subscription or delivery
/// ids. The string form is the document id in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidInput(format!("invalid job id '{s}': {e}")))
    }
}

/// Lifecycle state of a job.
///
/// `Waiting → Active → Completed | Failed`, with `Active → Waiting` when a
/// failed attempt is requeued or a stalled job is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued and claimable.
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Permanently failed.
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Waiting, Self::Active, Self::Completed, Self::Failed];

    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JobState> for Value {
    fn from(state: JobState) -> Self {
        Value::String(state.as_str().to_string())
    }
}

/// Submission metadata carried with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Who submitted the job (scheduler, api, manual).
    pub source: String,
    /// Batch the job was submitted in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl JobMetadata {
    /// Metadata for a job submitted from `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), batch_id: None }
    }

    /// Attaches a batch id.
    #[must_use]
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

impl Default for JobMetadata {
    fn default() -> Self {
        Self::new("api")
    }
}

/// A unit of work persisted in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, also the document id.
    pub id: JobId,
    /// Work key, e.g. the provider id to check.
    pub payload_key: String,
    /// Higher runs first.
    pub priority: i32,
    /// Requeues performed so far; never exceeds the configured maximum.
    pub retry_count: u32,
    /// Times the reaper reclaimed this job from a stalled worker.
    #[serde(default)]
    pub stalled_count: u32,
    /// Submission order within one engine, used to keep FIFO inside a
    /// priority band when timestamps collide.
    pub sequence: u64,
    /// Current lifecycle state.
    pub state: JobState,
    /// When the job was submitted.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the current attempt was claimed.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed successfully.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job failed permanently.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Worker that owns the current attempt.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Handler output of the successful attempt.
    #[serde(default)]
    pub result: Option<Value>,
    /// Terminal error; only set once the job is `Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Error of the most recent requeued attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Submission metadata.
    pub metadata: JobMetadata,
}

impl Job {
    /// Creates a waiting job.
    pub fn new(
        payload_key: impl Into<String>,
        priority: i32,
        metadata: JobMetadata,
        sequence: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            payload_key: payload_key.into(),
            priority,
            retry_count: 0,
            stalled_count: 0,
            sequence,
            state: JobState::Waiting,
            created_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            worker_id: None,
            result: None,
            error: None,
            last_error: None,
            metadata,
        }
    }

    /// Serializes the job into a store document.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the job does not serialize to a
    /// JSON object.
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(CoreError::Serialization(format!(
                "job serialized to non-object value: {other}"
            ))),
        }
    }

    /// Parses a store document back into a job.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if required fields are missing or
    /// have the wrong type.
    pub fn from_document(document: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    /// Time the current attempt has been running, if active.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.state, self.started_at) {
            (JobState::Active, Some(started_at)) => Some(now - started_at),
            _ => None,
        }
    }
}

/// Converts a timestamp into its stored epoch-millisecond form.
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::from(at.timestamp_millis())
}
