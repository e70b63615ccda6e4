//! Scripted operations for testing.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::errors::{PermanentError, TransientError};
use crate::errors::ResilienceError;

/// One scripted result.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Return this value.
    Succeed(serde_json::Value),
    /// Fail with a [`TransientError`].
    FailTransient(String),
    /// Fail with a [`PermanentError`].
    FailPermanent(String),
}

impl Outcome {
    fn into_result(self) -> anyhow::Result<serde_json::Value> {
        match self {
            Self::Succeed(value) => Ok(value),
            Self::FailTransient(message) => Err(TransientError::new(message).into()),
            Self::FailPermanent(message) => Err(PermanentError::new(message).into()),
        }
    }
}

/// An operation that replays scripted outcomes in order and counts calls.
///
/// Once the script runs out the fallback outcome repeats; without a fallback
/// each further call succeeds with `null`. Clones share the script and the
/// call counter.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperation {
    script: Arc<Mutex<VecDeque<Outcome>>>,
    fallback: Option<Outcome>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedOperation {
    /// Creates an operation with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an outcome to the script.
    #[must_use]
    pub fn then(self, outcome: Outcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    /// Appends a success.
    #[must_use]
    pub fn then_succeed(self, value: serde_json::Value) -> Self {
        self.then(Outcome::Succeed(value))
    }

    /// Appends a transient failure.
    #[must_use]
    pub fn then_fail_transient(self, message: impl Into<String>) -> Self {
        self.then(Outcome::FailTransient(message.into()))
    }

    /// Appends a permanent failure.
    #[must_use]
    pub fn then_fail_permanent(self, message: impl Into<String>) -> Self {
        self.then(Outcome::FailPermanent(message.into()))
    }

    /// Fails transiently on every call after the script.
    #[must_use]
    pub fn always_fail_transient(mut self, message: impl Into<String>) -> Self {
        self.fallback = Some(Outcome::FailTransient(message.into()));
        self
    }

    /// Succeeds with `value` on every call after the script.
    #[must_use]
    pub fn always_succeed(mut self, value: serde_json::Value) -> Self {
        self.fallback = Some(Outcome::Succeed(value));
        self
    }

    /// Sleeps for `delay` before every outcome.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs one call, returning the operation's own error type.
    pub fn invoke(&self) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or(Outcome::Succeed(serde_json::Value::Null));
        let delay = self.delay;

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome.into_result()
        })
    }

    /// Runs one call with the failure wrapped as an operation error.
    pub fn call(&self) -> BoxFuture<'static, Result<serde_json::Value, ResilienceError>> {
        let fut = self.invoke();
        Box::pin(async move { fut.await.map_err(ResilienceError::Operation) })
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_script_then_fallback() {
        let op = ScriptedOperation::new()
            .then_fail_transient("connection reset")
            .then_succeed(serde_json::json!({"id": 1}))
            .always_fail_transient("timeout");

        let first = op.invoke().await.unwrap_err();
        assert!(first.downcast_ref::<TransientError>().is_some());
        assert_eq!(op.invoke().await.unwrap(), serde_json::json!({"id": 1}));
        assert_eq!(op.call().await.unwrap_err().to_string(), "timeout");
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_script_and_counter() {
        let op = ScriptedOperation::new().then_fail_permanent("declined");
        let clone = op.clone();

        assert!(clone.invoke().await.is_err());
        assert!(op.invoke().await.unwrap().is_null());
        assert_eq!(op.calls(), 2);
    }
}
