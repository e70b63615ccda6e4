//! Circuit breaker state machine.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ─────────────────────────────────────────► Open
//!     ▲                                               │  ▲
//!     │ success_threshold                reset_timeout│  │ any failure
//!     │ consecutive successes                         ▼  │
//!     └─────────────────────────────────────────── HalfOpen
//! ```
//!
//! All state lives behind one mutex, so each outcome is applied as a single
//! read-modify-write. Concurrent failures cannot both trip the breaker or
//! move `next_retry_time` twice.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::errors::ResilienceError;
use crate::events::{self, EventSink};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing fast, calls are rejected until the reset timeout elapses.
    Open,
    /// Probing recovery, calls pass through and the next outcomes decide.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    next_retry_time: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            next_retry_time: None,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.next_retry_time = None;
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures counted in the current state.
    pub failure_count: u32,
    /// Successes counted in the current state.
    pub success_count: u32,
    /// Calls that reached the operation since creation.
    pub total_calls: u64,
    /// Calls that failed since creation.
    pub total_failures: u64,
    /// Calls rejected while open since creation.
    pub total_rejections: u64,
    /// Milliseconds until an open breaker admits a probe.
    pub retry_in_ms: Option<u64>,
}

/// What the breaker decided when a call arrived.
enum Admission {
    Allowed,
    Probe,
    Rejected(Duration),
}

/// Per-target circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Creates a breaker for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            sink: events::noop_sink(),
        }
    }

    /// Sets the sink that receives state transition events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `op` if the breaker admits the call and records its outcome.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `op` while
    /// the breaker is open.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.try_acquire()?;

        let result = op().await;
        match result {
            Ok(_) => self.record_success(),
            Err(ref e) => {
                debug!(target_name = %self.name, error = %e, "Protected call failed");
                self.record_failure();
            }
        }
        result
    }

    /// Checks whether a call may proceed, moving Open to HalfOpen once the
    /// reset timeout has elapsed.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let now = Instant::now();
        let admission = {
            let mut s = self.state.lock();
            match s.state {
                CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed,
                CircuitState::Open => match s.next_retry_time {
                    Some(at) if now < at => {
                        s.total_rejections += 1;
                        Admission::Rejected(at - now)
                    }
                    _ => {
                        s.state = CircuitState::HalfOpen;
                        s.failure_count = 0;
                        s.success_count = 0;
                        s.next_retry_time = None;
                        Admission::Probe
                    }
                },
            }
        };

        match admission {
            Admission::Allowed => Ok(()),
            Admission::Probe => {
                info!(target_name = %self.name, "Circuit half-open, admitting probe");
                self.sink.try_emit(
                    events::CIRCUIT_HALF_OPENED,
                    Some(serde_json::json!({ "target": self.name })),
                );
                Ok(())
            }
            Admission::Rejected(retry_after) => Err(ResilienceError::CircuitOpen {
                target: self.name.clone(),
                retry_after,
            }),
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let now = Instant::now();
        let closed = {
            let mut s = self.state.lock();
            s.total_calls += 1;
            s.last_success_time = Some(now);
            match s.state {
                CircuitState::Closed => {
                    s.failure_count = 0;
                    s.success_count = s.success_count.saturating_add(1);
                    false
                }
                CircuitState::HalfOpen => {
                    s.success_count += 1;
                    if s.success_count >= self.config.success_threshold {
                        s.close();
                        true
                    } else {
                        false
                    }
                }
                // A call admitted before the trip finished late; it does not reopen anything.
                CircuitState::Open => false,
            }
        };

        if closed {
            info!(target_name = %self.name, "Circuit closed after successful probes");
            self.sink.try_emit(
                events::CIRCUIT_CLOSED,
                Some(serde_json::json!({ "target": self.name })),
            );
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let reset_timeout = self.config.reset_timeout();
        let opened_with = {
            let mut s = self.state.lock();
            s.total_calls += 1;
            s.total_failures += 1;
            s.last_failure_time = Some(now);
            match s.state {
                CircuitState::Closed => {
                    s.failure_count += 1;
                    if s.failure_count >= self.config.failure_threshold {
                        s.state = CircuitState::Open;
                        s.success_count = 0;
                        s.next_retry_time = Some(now + reset_timeout);
                        Some(s.failure_count)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    s.failure_count += 1;
                    s.state = CircuitState::Open;
                    s.success_count = 0;
                    s.next_retry_time = Some(now + reset_timeout);
                    Some(s.failure_count)
                }
                CircuitState::Open => None,
            }
        };

        if let Some(failures) = opened_with {
            warn!(
                target_name = %self.name,
                failures,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit opened"
            );
            self.sink.try_emit(
                events::CIRCUIT_OPENED,
                Some(serde_json::json!({
                    "target": self.name,
                    "failures": failures,
                    "reset_timeout_ms": self.config.reset_timeout_ms,
                })),
            );
        }
    }

    /// Forces the breaker closed and zeroes its counters.
    pub fn reset(&self) {
        self.state.lock().close();
        info!(target_name = %self.name, "Circuit reset");
        self.sink.try_emit(
            events::CIRCUIT_RESET,
            Some(serde_json::json!({ "target": self.name })),
        );
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns a snapshot of state and counters.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let s = self.state.lock();
        CircuitSnapshot {
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            total_calls: s.total_calls,
            total_failures: s.total_failures,
            total_rejections: s.total_rejections,
            retry_in_ms: s.next_retry_time.map(|at| {
                u64::try_from(at.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)
            }),
        }
    }

    /// Time since the last recorded failure.
    #[must_use]
    pub fn since_last_failure(&self) -> Option<Duration> {
        self.state.lock().last_failure_time.map(|t| t.elapsed())
    }

    /// Time since the last recorded success.
    #[must_use]
    pub fn since_last_success(&self) -> Option<Duration> {
        self.state.lock().last_success_time.map(|t| t.elapsed())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failure_threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "payment-api",
            CircuitBreakerConfig::new()
                .with_failure_threshold(failure_threshold)
                .with_reset_timeout_ms(reset_ms),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), ResilienceError> {
        cb.execute(|| async { Err::<(), _>(anyhow::anyhow!("connection reset").into()) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), ResilienceError> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_fails_fast() {
        let cb = breaker(3, 1_000);
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(ResilienceError::Operation(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.snapshot().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count_when_closed() {
        let cb = breaker(3, 1_000);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.snapshot().failure_count, 2);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);

        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let cb = breaker(2, 500);
        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        let retry_after = match succeed(&cb).await {
            Err(ResilienceError::CircuitOpen { retry_after, .. }) => retry_after,
            other => panic!("expected CircuitOpen, got {other:?}"),
        };
        assert!(retry_after <= Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(500)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert!(snapshot.retry_in_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 200);
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_millis(200)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await.ok();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.retry_in_ms, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, 10_000);
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_while_open_keeps_retry_time() {
        let cb = breaker(1, 1_000);
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_millis(400)).await;

        // Outcome of a call admitted before the trip.
        cb.record_failure();

        assert_eq!(cb.snapshot().retry_in_ms, Some(600));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_trip_once() {
        let mut sink = MockEventSink::new();
        sink.expect_try_emit()
            .withf(|event_type, _| event_type == events::CIRCUIT_OPENED)
            .times(1)
            .return_const(());

        let cb = Arc::new(breaker(4, 60_000).with_event_sink(Arc::new(sink)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.record_failure() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 4);
        assert_eq!(snapshot.total_failures, 16);
    }
}
