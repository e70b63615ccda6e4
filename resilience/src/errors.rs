//! Error types for the resilience pipeline.
//!
//! Every protective mechanism surfaces its own error kind so callers can tell
//! an admission failure (open circuit, full bulkhead, rate limit, timeout,
//! cancellation) apart from the operation's own domain error, which is carried
//! unchanged in [`ResilienceError::Operation`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type returned by every mechanism and by the manager.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The target's circuit breaker is open; the operation was not invoked.
    #[error("Circuit breaker for '{target}' is open (retry in {}ms)", .retry_after.as_millis())]
    CircuitOpen {
        /// The target name.
        target: String,
        /// Time remaining until the breaker admits a probe call.
        retry_after: Duration,
    },

    /// The bulkhead is at capacity and its wait queue is full.
    #[error("Bulkhead for '{target}' is full ({max_concurrent} running, {max_queue} queued)")]
    BulkheadFull {
        /// The target name.
        target: String,
        /// Configured concurrency limit.
        max_concurrent: usize,
        /// Configured wait queue capacity.
        max_queue: usize,
    },

    /// The sliding-window rate limit has been reached.
    #[error("Rate limit exceeded for '{target}' (retry in {}ms)", .retry_after.as_millis())]
    RateLimitExceeded {
        /// The target name.
        target: String,
        /// Time until the oldest recorded request leaves the window.
        retry_after: Duration,
    },

    /// The deadline elapsed before the guarded work completed.
    #[error("Operation on '{target}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The target name.
        target: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The caller cancelled the call.
    #[error("Operation on '{target}' cancelled: {reason}")]
    Cancelled {
        /// The target name.
        target: String,
        /// The cancellation reason.
        reason: String,
    },

    /// No target with this name is registered.
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// A cached value could not be converted.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation itself failed. The inner error is passed through as-is.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Discriminant of [`ResilienceError`] without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ResilienceError::CircuitOpen`].
    CircuitOpen,
    /// See [`ResilienceError::BulkheadFull`].
    BulkheadFull,
    /// See [`ResilienceError::RateLimitExceeded`].
    RateLimitExceeded,
    /// See [`ResilienceError::Timeout`].
    Timeout,
    /// See [`ResilienceError::Cancelled`].
    Cancelled,
    /// See [`ResilienceError::UnknownTarget`].
    UnknownTarget,
    /// See [`ResilienceError::Serialization`].
    Serialization,
    /// See [`ResilienceError::Operation`].
    Operation,
}

impl ErrorKind {
    /// Returns the stable string name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::BulkheadFull => "bulkhead_full",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UnknownTarget => "unknown_target",
            Self::Serialization => "serialization",
            Self::Operation => "operation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ResilienceError {
    /// Wraps a domain error from the protected operation.
    pub fn operation<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Operation(anyhow::Error::new(error))
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::UnknownTarget(_) => ErrorKind::UnknownTarget,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Returns true for the five kinds raised by a protective mechanism
    /// rather than by the operation.
    #[must_use]
    pub const fn is_protective(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::BulkheadFull { .. }
                | Self::RateLimitExceeded { .. }
                | Self::Timeout { .. }
                | Self::Cancelled { .. }
        )
    }

    /// Suggested wait before trying again, when the mechanism knows one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimitExceeded { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Returns the operation's own error, if this is one.
    #[must_use]
    pub const fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the error and returns the operation's own error, if this is one.
    pub fn into_operation_error(self) -> Result<anyhow::Error, Self> {
        match self {
            Self::Operation(e) => Ok(e),
            other => Err(other),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind().as_str()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::CircuitOpen { target, .. }
            | Self::BulkheadFull { target, .. }
            | Self::RateLimitExceeded { target, .. }
            | Self::Timeout { target, .. }
            | Self::Cancelled { target, .. } => {
                map.insert("target".to_string(), serde_json::json!(target));
            }
            Self::UnknownTarget(name) => {
                map.insert("target".to_string(), serde_json::json!(name));
            }
            Self::Serialization(_) | Self::Operation(_) => {}
        }

        if let Some(wait) = self.retry_after() {
            map.insert(
                "retry_after_ms".to_string(),
                serde_json::json!(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)),
            );
        }

        map
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the mechanism cannot work with.
    #[error("Invalid configuration for '{field}': {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("card declined")]
    struct CardDeclined;

    #[test]
    fn test_protective_kinds() {
        let open = ResilienceError::CircuitOpen {
            target: "payment-api".to_string(),
            retry_after: Duration::from_millis(250),
        };
        assert!(open.is_protective());
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert_eq!(open.retry_after(), Some(Duration::from_millis(250)));

        let op = ResilienceError::operation(CardDeclined);
        assert!(!op.is_protective());
        assert_eq!(op.kind(), ErrorKind::Operation);
        assert!(op.retry_after().is_none());
    }

    #[test]
    fn test_operation_error_passes_through() {
        let err = ResilienceError::operation(CardDeclined);
        assert_eq!(err.to_string(), "card declined");

        let inner = err.into_operation_error().ok();
        assert!(inner.is_some_and(|e| e.downcast_ref::<CardDeclined>().is_some()));
    }

    #[test]
    fn test_to_dict() {
        let err = ResilienceError::RateLimitExceeded {
            target: "search".to_string(),
            retry_after: Duration::from_millis(400),
        };
        let dict = err.to_dict();

        assert_eq!(dict.get("kind").unwrap(), "rate_limit_exceeded");
        assert_eq!(dict.get("target").unwrap(), "search");
        assert_eq!(dict.get("retry_after_ms").unwrap(), 400);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("retry.max_attempts", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for 'retry.max_attempts': must be > 0"
        );
    }
}
