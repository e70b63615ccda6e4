//! Sliding-window rate limiter.
//!
//! Keeps the instants of the requests admitted within the trailing window.
//! A request is admitted when, after dropping instants older than the
//! window, fewer than `max_requests` remain.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RateLimiterConfig;
use crate::errors::ResilienceError;
use crate::events::{self, EventSink};

#[derive(Debug, Default)]
struct WindowState {
    timestamps: VecDeque<Instant>,
    total_allowed: u64,
    total_rejected: u64,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    /// Requests admitted within the current window.
    pub current_requests: usize,
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests admitted since creation.
    pub total_allowed: u64,
    /// Requests rejected since creation.
    pub total_rejected: u64,
}

/// Per-target rate limiter.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<WindowState>,
    sink: Arc<dyn EventSink>,
}

impl RateLimiter {
    /// Creates a rate limiter for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(WindowState::default()),
            sink: events::noop_sink(),
        }
    }

    /// Sets the sink that receives rejection events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Records a request if the window has room.
    ///
    /// On rejection the error carries the time until the oldest request in
    /// the window expires.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let now = Instant::now();
        let window = self.config.window();
        let rejected_for = {
            let mut s = self.state.lock();
            s.prune(now, window);
            if s.timestamps.len() < self.config.max_requests {
                s.timestamps.push_back(now);
                s.total_allowed += 1;
                None
            } else {
                s.total_rejected += 1;
                let oldest = s.timestamps.front().copied().unwrap_or(now);
                Some(window.saturating_sub(now.saturating_duration_since(oldest)))
            }
        };

        match rejected_for {
            None => Ok(()),
            Some(retry_after) => {
                let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    target_name = %self.name,
                    max_requests = self.config.max_requests,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                self.sink.try_emit(
                    events::RATE_LIMIT_EXCEEDED,
                    Some(serde_json::json!({
                        "target": self.name,
                        "max_requests": self.config.max_requests,
                        "window_ms": self.config.window_ms,
                        "retry_after_ms": retry_after_ms,
                    })),
                );
                Err(ResilienceError::RateLimitExceeded {
                    target: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Runs `op` if the window has room; otherwise fails without invoking it.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.try_acquire()?;
        op().await
    }

    /// Requests still available in the current window.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let mut s = self.state.lock();
        s.prune(Instant::now(), self.config.window());
        self.config.max_requests.saturating_sub(s.timestamps.len())
    }

    /// Returns a snapshot of the limiter.
    #[must_use]
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut s = self.state.lock();
        s.prune(Instant::now(), self.config.window());
        RateLimiterSnapshot {
            current_requests: s.timestamps.len(),
            max_requests: self.config.max_requests,
            window_ms: self.config.window_ms,
            total_allowed: s.total_allowed,
            total_rejected: s.total_rejected,
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
