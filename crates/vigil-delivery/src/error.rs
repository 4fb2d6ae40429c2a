//! Error types for delivery operations.
//!
//! Transport errors carry enough context to decide whether a target is
//! worth another attempt. Rejections from the queue itself (`QueueFull`,
//! `Stopped`, `InvalidInput`) are returned to the caller synchronously.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by delivery queues, channels and registries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Queue holds `max` jobs already.
    #[error("delivery queue full ({max} jobs)")]
    QueueFull {
        /// Configured capacity.
        max: usize,
    },

    /// Queue has been stopped.
    #[error("delivery queue stopped")]
    Stopped,

    /// Caller supplied an unusable job or configuration.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What was wrong.
        message: String,
    },

    /// Channel breaker rejected the call without running it.
    #[error("circuit breaker open for channel {channel}")]
    CircuitOpen {
        /// Channel name.
        channel: String,
    },

    /// Network-level failure talking to a target.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the failure.
        message: String,
    },

    /// Request or pass exceeded its deadline.
    #[error("timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Target answered with an unsuccessful HTTP status.
    #[error("HTTP {status_code}")]
    Http {
        /// Response status.
        status_code: u16,
    },

    /// Subscription registry failed.
    #[error("registry error: {message}")]
    Registry {
        /// Error message.
        message: String,
    },

    /// Client or channel could not be configured.
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message.
        message: String,
    },
}

impl DeliveryError {
    /// Creates an invalid-input rejection.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a registry error.
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether a later attempt could succeed.
    ///
    /// HTTP 429 and 5xx are retryable; every other 4xx is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. } => true,
            Self::Http { status_code } => *status_code == 429 || *status_code >= 500,
            Self::QueueFull { .. }
            | Self::Stopped
            | Self::InvalidInput { .. }
            | Self::Registry { .. }
            | Self::Configuration { .. } => false,
        }
    }
}
