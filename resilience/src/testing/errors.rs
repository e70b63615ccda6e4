//! Error types used by scripted operations.

use thiserror::Error;

/// A failure the default retry predicate treats as transient, provided its
/// message names an allow-listed kind (e.g. "connection reset").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransientError {
    message: String,
}

impl TransientError {
    /// Creates a transient error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A business failure that must not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PermanentError {
    message: String,
}

impl PermanentError {
    /// Creates a permanent error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
