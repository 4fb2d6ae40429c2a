//! Error types for the document-store boundary.
//!
//! Every adapter operation reports failures through `CoreError`. The engine
//! maps these into its own taxonomy to decide between retrying and giving up.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by store adapters and document conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The backing store rejected or failed the operation.
    #[error("store error: {0}")]
    Store(String),

    /// Requested document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write would violate a uniqueness or shape constraint.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A document could not be converted to or from its typed model.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates a store error from a message.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Only raw store failures are transient. Missing documents, constraint
    /// violations and malformed documents fail identically on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
