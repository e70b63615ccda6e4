//! Deadline guard.
//!
//! The guarded future runs on its own task and is raced against the
//! deadline. When the deadline fires first the caller gets
//! [`ResilienceError::Timeout`] right away, but the task is only detached,
//! not stopped: the in-flight attempt keeps running in the background and its
//! result is discarded. This is a known resource-leak risk. Operations that
//! must not outlive their caller have to be cancellable or idempotent on
//! their own.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cancellation::CancellationToken;
use crate::config::TimeoutConfig;
use crate::errors::ResilienceError;
use crate::events::{self, EventSink};

/// Per-target timeout guard.
#[derive(Clone)]
pub struct TimeoutGuard {
    name: String,
    timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl TimeoutGuard {
    /// Creates a guard for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &TimeoutConfig) -> Self {
        Self {
            name: name.into(),
            timeout: config.timeout(),
            sink: events::noop_sink(),
        }
    }

    /// Sets the sink that receives timeout events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Awaits `fut` for at most the configured deadline.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        self.execute_cancellable(fut, None).await
    }

    /// Like [`TimeoutGuard::execute`], also returning
    /// [`ResilienceError::Cancelled`] as soon as `cancel` fires.
    ///
    /// A panic inside the guarded future is resumed on the caller.
    pub async fn execute_cancellable<T, Fut>(
        &self,
        fut: Fut,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let mut task = tokio::spawn(fut);
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(ResilienceError::Cancelled {
                    target: self.name.clone(),
                    reason: "guarded task aborted".to_string(),
                }),
            },
            () = tokio::time::sleep(self.timeout) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    target_name = %self.name,
                    timeout_ms,
                    "Deadline elapsed, in-flight attempt left running in background"
                );
                self.sink.try_emit(
                    events::TIMEOUT_ELAPSED,
                    Some(serde_json::json!({
                        "target": self.name,
                        "timeout_ms": timeout_ms,
                    })),
                );
                Err(ResilienceError::Timeout {
                    target: self.name.clone(),
                    timeout: self.timeout,
                })
            }
            () = cancelled => Err(ResilienceError::Cancelled {
                target: self.name.clone(),
                reason: cancel
                    .and_then(CancellationToken::reason)
                    .unwrap_or_else(|| "cancelled".to_string()),
            }),
        }
    }
}

impl fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGuard")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventSink;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn guard(timeout_ms: u64) -> TimeoutGuard {
        TimeoutGuard::new("report-service", &TimeoutConfig::new(timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_deadline() {
        let result = guard(100)
            .execute(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_leaves_attempt_running() {
        let mut sink = MockEventSink::new();
        sink.expect_try_emit()
            .withf(|event_type, _| event_type == events::TIMEOUT_ELAPSED)
            .times(1)
            .return_const(());
        let g = guard(100).with_event_sink(Arc::new(sink));

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let result = g
            .execute(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(ResilienceError::Timeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_passes_through() {
        let result: Result<(), _> = guard(100)
            .execute(async { Err(anyhow::anyhow!("bad request").into()) })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "bad request");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_cancelled() {
        let token = Arc::new(CancellationToken::new());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("user aborted");
            })
        };

        let result: Result<(), _> = guard(1_000)
            .execute_cancellable(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                Some(token.as_ref()),
            )
            .await;

        canceller.await.unwrap();
        match result {
            Err(ResilienceError::Cancelled { reason, .. }) => assert_eq!(reason, "user aborted"),
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    #[should_panic(expected = "inner panic")]
    async fn test_panic_is_resumed() {
        let _ = guard(1_000)
            .execute(async {
                if true {
                    panic!("inner panic");
                }
                Ok(())
            })
            .await;
    }
}
