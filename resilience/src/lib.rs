//! # Resilience
//!
//! A composable fault-tolerance pipeline for calls to remote dependencies.
//!
//! Every named downstream target gets its own chain of protections:
//!
//! - **Circuit breaker**: stops calling a failing target until it recovers
//! - **Retry**: re-runs transient failures with exponential backoff and jitter
//! - **Bulkhead**: caps concurrent calls and queues a bounded overflow
//! - **Rate limiter**: sliding-window admission control
//! - **Timeout**: bounds how long a caller waits for the whole call
//! - **Cache-aside**: TTL read-through cache for idempotent reads
//!
//! Layers wrap the operation in a fixed order, outermost first:
//! rate limit, bulkhead, timeout, retry, circuit breaker.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use resilience::prelude::*;
//!
//! let config = ManagerConfig::new().with_target(
//!     "payments",
//!     PolicyConfig::new()
//!         .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(5))
//!         .with_retry(RetryConfig::new().with_max_attempts(3))
//!         .with_timeout(TimeoutConfig::new(2_000)),
//! );
//! let manager = ResilienceManager::new(config)?;
//!
//! let receipt = manager
//!     .execute("payments", || async { charge_card().await })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod policies;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        BulkheadConfig, CacheConfig, CircuitBreakerConfig, ManagerConfig,
        PolicyConfig, RateLimiterConfig, RetryConfig, TimeoutConfig,
    };
    pub use crate::errors::{ConfigError, ErrorKind, ResilienceError};
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::observability::{init_tracing, LogFormat, LoggingConfig};
    pub use crate::pipeline::{
        HealthStatus, ResilienceManager, ServiceHealthSnapshot,
    };
    pub use crate::policies::{
        Bulkhead, CacheAside, CircuitBreaker, CircuitState, RateLimiter,
        RetryPolicy, TimeoutGuard,
    };
}
