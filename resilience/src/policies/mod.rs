//! Protective mechanisms.
//!
//! Each mechanism is usable on its own and knows nothing about the others.
//! The manager in [`crate::pipeline`] composes them per target.

pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadSnapshot};
pub use cache::{CacheAside, CacheStats};
pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use retry::{matches_retryable, RetryPolicy, RetryPredicate};
pub use timeout::TimeoutGuard;
