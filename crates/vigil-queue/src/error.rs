//! Error types for queue operations.
//!
//! Errors fall into three groups. Rejections are returned synchronously to
//! submitters and never retried. Transient errors are retried by the guarded
//! store's backoff loop, except `CircuitOpen`, which ends the loop at once.
//! Terminal job failures are not errors at all: they are recorded on the job
//! and reported through events and metrics.

use std::{fmt, time::Duration};

use thiserror::Error;
use vigil_core::CoreError;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by the job queue engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity; the caller must back off.
    #[error("queue full: {current} of {max} slots in use")]
    QueueFull {
        /// Waiting plus active jobs at admission time.
        current: usize,
        /// Configured capacity.
        max: usize,
    },

    /// Queue is paused or shutting down.
    #[error("queue is shutting down")]
    ShuttingDown,

    /// Caller supplied an unusable argument.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What was wrong with the input.
        message: String,
    },

    /// A worker with this id is already registered.
    #[error("worker {worker_id} already exists")]
    WorkerExists {
        /// Conflicting worker id.
        worker_id: String,
    },

    /// No worker with this id is registered.
    #[error("worker {worker_id} not found")]
    WorkerNotFound {
        /// Requested worker id.
        worker_id: String,
    },

    /// `initialize()` has not been called yet.
    #[error("queue engine not initialized")]
    NotInitialized,

    /// Circuit breaker rejected the call without running it.
    #[error("circuit breaker open for {dependency}")]
    CircuitOpen {
        /// Protected dependency.
        dependency: String,
    },

    /// Store failed in a way that may succeed on retry.
    #[error("store error: {message}")]
    Store {
        /// Store error message.
        message: String,
    },

    /// Store rejected the data itself; retrying cannot help.
    #[error("store data error: {message}")]
    Data {
        /// Underlying error message.
        message: String,
    },

    /// Store operation exceeded its deadline.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Workers or active jobs did not finish within the shutdown window.
    #[error("shutdown did not complete within {}ms", timeout.as_millis())]
    ShutdownTimeout {
        /// Shutdown window.
        timeout: Duration,
    },
}

impl QueueError {
    /// Creates a queue-full rejection.
    pub fn queue_full(current: usize, max: usize) -> Self {
        Self::QueueFull { current, max }
    }

    /// Creates an invalid-input rejection.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a worker-exists rejection.
    pub fn worker_exists(worker_id: impl Into<String>) -> Self {
        Self::WorkerExists { worker_id: worker_id.into() }
    }

    /// Creates a worker-not-found rejection.
    pub fn worker_not_found(worker_id: impl Into<String>) -> Self {
        Self::WorkerNotFound { worker_id: worker_id.into() }
    }

    /// Creates a circuit-open error.
    pub fn circuit_open(dependency: impl Into<String>) -> Self {
        Self::CircuitOpen { dependency: dependency.into() }
    }

    /// Creates a transient store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout { operation: operation.into(), timeout }
    }

    /// Whether the guarded store's backoff loop should try again.
    ///
    /// `CircuitOpen` is deliberately excluded: a retry would only hit the
    /// open breaker again before its cooldown.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } | Self::Timeout { .. } => true,

            Self::QueueFull { .. }
            | Self::ShuttingDown
            | Self::InvalidInput { .. }
            | Self::WorkerExists { .. }
            | Self::WorkerNotFound { .. }
            | Self::NotInitialized
            | Self::CircuitOpen { .. }
            | Self::Data { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Whether the error is a synchronous rejection of the caller's request.
    pub fn is_rejection(&self) -> bool {
        ErrorCategory::from(self) == ErrorCategory::Rejection
    }
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        if err.is_transient() {
            Self::Store { message: err.to_string() }
        } else {
            Self::Data { message: err.to_string() }
        }
    }
}

/// Category of queue error for logs and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller request refused.
    Rejection,
    /// Dependency failure that may clear on its own.
    Transient,
    /// Circuit breaker protection.
    Circuit,
    /// Engine-internal failure.
    Internal,
}

impl From<&QueueError> for ErrorCategory {
    fn from(error: &QueueError) -> Self {
        match error {
            QueueError::QueueFull { .. }
            | QueueError::ShuttingDown
            | QueueError::InvalidInput { .. }
            | QueueError::WorkerExists { .. }
            | QueueError::WorkerNotFound { .. }
            | QueueError::NotInitialized => Self::Rejection,
            QueueError::Store { .. } | QueueError::Timeout { .. } => Self::Transient,
            QueueError::CircuitOpen { .. } => Self::Circuit,
            QueueError::Data { .. } | QueueError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejection => write!(f, "rejection"),
            Self::Transient => write!(f, "transient"),
            Self::Circuit => write!(f, "circuit"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
