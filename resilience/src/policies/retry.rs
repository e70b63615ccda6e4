//! Bounded retries with exponential backoff and jitter.
//!
//! The delay after failed attempt `n` (1-based) is
//! `min(base_delay * backoff_multiplier^(n-1), max_delay)` plus a random
//! jitter of up to `jitter_ratio` of that delay.
//!
//! Only errors accepted by the retry predicate are retried. The default
//! predicate matches the operation error chain against the configured
//! allow-list of transient error kinds; everything else, including every
//! protective error raised by inner layers, is propagated after the attempt
//! that produced it.
//!
//! A retry sequence running under a timeout is given the call's scope token;
//! once the caller has been answered, no further attempt is started.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::config::RetryConfig;
use crate::errors::ResilienceError;
use crate::events::{self, EventSink};

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

/// Returns true if `error` is an operation error whose chain matches one of
/// the allow-listed kinds.
///
/// A kind matches a cause when the cause's message contains it
/// (case-insensitive) or when the cause is an [`std::io::Error`] whose
/// [`std::io::ErrorKind`] has that name (e.g. `ConnectionReset`).
#[must_use]
pub fn matches_retryable(error: &ResilienceError, kinds: &[String]) -> bool {
    let Some(op_error) = error.operation_error() else {
        return false;
    };

    op_error.chain().any(|cause| {
        let message = cause.to_string().to_lowercase();
        let io_kind = cause
            .downcast_ref::<std::io::Error>()
            .map(|io| format!("{:?}", io.kind()));

        kinds.iter().any(|kind| {
            message.contains(&kind.to_lowercase())
                || io_kind
                    .as_deref()
                    .is_some_and(|k| k.eq_ignore_ascii_case(kind))
        })
    })
}

/// Retry policy for one target.
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    predicate: RetryPredicate,
    sink: Arc<dyn EventSink>,
}

impl RetryPolicy {
    /// Creates a policy using the config's allow-list as retry predicate.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        let kinds = config.retryable_errors.clone();
        Self {
            name: name.into(),
            config,
            predicate: Arc::new(move |e| matches_retryable(e, &kinds)),
            sink: events::noop_sink(),
        }
    }

    /// Replaces the retry predicate.
    ///
    /// Non-idempotent operations should supply a conservative predicate.
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Sets the sink that receives retry events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if the policy's predicate accepts `error`.
    #[must_use]
    pub fn is_retryable(&self, error: &ResilienceError) -> bool {
        (self.predicate)(error)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw_ms = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped_ms.max(0.0).round() as u64)
    }

    /// Delay after failed attempt `attempt`, including jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.config.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen::<f64>() * self.config.jitter_ratio;
        delay + delay.mul_f64(factor)
    }

    /// Runs `op` until it succeeds, the predicate rejects its error, or
    /// `max_attempts` is reached. The last error is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let predicate = self.predicate.clone();
        self.run(op, move |e| predicate(e), None).await
    }

    /// Like [`RetryPolicy::execute`] with a per-call retry predicate.
    pub async fn execute_with<T, F, Fut, P>(
        &self,
        op: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        P: Fn(&ResilienceError) -> bool,
    {
        self.run(op, is_retryable, None).await
    }

    /// Like [`RetryPolicy::execute`], but no further attempt is started once
    /// `cancel` fires. A pending backoff sleep is cut short and the last
    /// error is returned.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        op: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let predicate = self.predicate.clone();
        self.run(op, move |e| predicate(e), cancel).await
    }

    async fn run<T, F, Fut, P>(
        &self,
        mut op: F,
        is_retryable: P,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        P: Fn(&ResilienceError) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(target_name = %self.name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= max_attempts || !is_retryable(&e) {
                        return Err(e);
                    }
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        debug!(target_name = %self.name, attempt, "Retry sequence stopped");
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    debug!(
                        target_name = %self.name,
                        attempt,
                        delay_ms,
                        error = %e,
                        "Retrying after error"
                    );
                    self.sink.try_emit(
                        events::RETRY_SCHEDULED,
                        Some(serde_json::json!({
                            "target": self.name,
                            "attempt": attempt,
                            "delay_ms": delay_ms,
                            "error": e.to_string(),
                        })),
                    );

                    let stopped = async {
                        match cancel {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = stopped => {
                            debug!(target_name = %self.name, attempt, "Retry sequence stopped during backoff");
                            return Err(e);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PermanentError, ScriptedOperation, TransientError};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "inventory",
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay_ms(100)
                .with_backoff_multiplier(2.0),
        )
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let p = RetryPolicy::new(
            "x",
            RetryConfig::new()
                .with_base_delay_ms(100)
                .with_max_delay_ms(500)
                .with_backoff_multiplier(2.0),
        );
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(p.backoff_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounded_by_ratio() {
        let p = policy(3);
        for _ in 0..100 {
            let d = p.delay_for_attempt(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_default_predicate_matches_allow_list() {
        let kinds = RetryConfig::default().retryable_errors;

        let transient = ResilienceError::operation(TransientError::new("connection reset by peer"));
        assert!(matches_retryable(&transient, &kinds));

        let io = ResilienceError::operation(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(matches_retryable(&io, &["TimedOut".to_string()]));

        let permanent = ResilienceError::operation(PermanentError::new("invalid card number"));
        assert!(!matches_retryable(&permanent, &kinds));

        let open = ResilienceError::CircuitOpen {
            target: "x".to_string(),
            retry_after: Duration::from_secs(1),
        };
        assert!(!matches_retryable(&open, &kinds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds_with_backoff() {
        let p = policy(3);
        let op = ScriptedOperation::new()
            .then_fail_transient("connection reset")
            .then_fail_transient("connection reset")
            .then_succeed(serde_json::json!("ok"));

        let started = Instant::now();
        let result = p.execute(|| op.call()).await;
        let elapsed = started.elapsed();

        assert_eq!(result.unwrap(), serde_json::json!("ok"));
        assert_eq!(op.calls(), 3);
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(330), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_attempted_once() {
        let p = policy(5);
        let op = ScriptedOperation::new().then_fail_permanent("invalid card number");

        let result = p.execute(|| op.call()).await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "invalid card number");
        assert!(err
            .operation_error()
            .is_some_and(|e| e.downcast_ref::<PermanentError>().is_some()));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let p = policy(3);
        let op = ScriptedOperation::new().always_fail_transient("ETIMEDOUT");

        let result = p.execute(|| op.call()).await;

        assert!(result.unwrap_err().to_string().contains("ETIMEDOUT"));
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_allow_list() {
        let p = policy(4).with_predicate(|_| false);
        let op = ScriptedOperation::new().always_fail_transient("connection reset");

        assert!(p.execute(|| op.call()).await.is_err());
        assert_eq!(op.calls(), 1);

        let op = ScriptedOperation::new()
            .then_fail_permanent("409 conflict")
            .then_succeed(serde_json::json!(1));
        let result = policy(4)
            .execute_with(|| op.call(), |e| e.to_string().contains("409"))
            .await;
        assert!(result.is_ok());
        assert_eq!(op.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_further_attempts() {
        let p = policy(5);
        let op = ScriptedOperation::new().always_fail_transient("connection reset");
        let token = Arc::new(crate::cancellation::CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                token.cancel("caller answered");
            })
        };

        let started = Instant::now();
        let result = p.execute_cancellable(|| op.call(), Some(token.as_ref())).await;
        canceller.await.unwrap();

        assert!(result.unwrap_err().to_string().contains("connection reset"));
        assert_eq!(op.calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(200));

        let again = ScriptedOperation::new().always_fail_transient("connection reset");
        assert!(p.execute_cancellable(|| again.call(), Some(token.as_ref())).await.is_err());
        assert_eq!(again.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_retry_events() {
        let sink = Arc::new(crate::events::CollectingEventSink::new());
        let p = policy(3).with_event_sink(sink.clone());
        let op = ScriptedOperation::new().always_fail_transient("timeout");

        p.execute(|| op.call()).await.ok();

        assert_eq!(sink.events_of_type(events::RETRY_SCHEDULED).len(), 2);
    }
}
