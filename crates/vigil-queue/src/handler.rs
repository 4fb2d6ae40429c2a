//! Pluggable downstream work.
//!
//! The engine knows nothing about what a job does. The embedding application
//! supplies a `JobHandler`; the engine only needs to know whether a failure
//! is worth retrying.

use serde_json::Value;
use thiserror::Error;
use vigil_core::Job;

/// Message fragments that mark a handler failure as permanent.
///
/// Matching is case-insensitive. Retrying these would loop forever on an
/// error the downstream will never stop returning.
pub const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "permission denied",
    "unauthorized",
    "forbidden",
    "malformed",
    "invalid",
    "not found",
    "unsupported",
];

/// Whether `message` matches one of the permanent-failure patterns.
pub fn is_non_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();
    NON_RETRYABLE_PATTERNS.iter().any(|pattern| message.contains(pattern))
}

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    /// Human-readable failure description, stored on the job.
    pub message: String,
    /// Whether the job should be requeued.
    pub retryable: bool,
}

impl JobError {
    /// A failure that may succeed on a later attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    /// A failure that will never succeed.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }

    /// Classifies a failure by its message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = !is_non_retryable_message(&message);
        Self { message, retryable }
    }
}

/// Processes one claimed job.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Runs the job and returns its result document.
    ///
    /// # Errors
    ///
    /// Returns `JobError`; its `retryable` flag decides between requeue and
    /// terminal failure.
    async fn handle(&self, job: &Job) -> Result<Value, JobError>;
}
