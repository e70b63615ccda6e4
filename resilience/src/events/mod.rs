//! Event sink system for observability.
//!
//! Mechanisms report state changes (circuit transitions, rejections,
//! scheduled retries, elapsed deadlines) to an [`EventSink`]. The sink is
//! injected by the manager; standalone mechanisms default to
//! [`NoOpEventSink`].

mod sink;

#[cfg(test)]
pub use sink::MockEventSink;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Circuit moved from closed (or half-open) to open.
pub const CIRCUIT_OPENED: &str = "circuit.opened";
/// Circuit admitted a probe after its reset timeout.
pub const CIRCUIT_HALF_OPENED: &str = "circuit.half_opened";
/// Circuit recovered and closed.
pub const CIRCUIT_CLOSED: &str = "circuit.closed";
/// Circuit was forced closed by an administrator.
pub const CIRCUIT_RESET: &str = "circuit.reset";
/// Bulkhead turned a caller away.
pub const BULKHEAD_REJECTED: &str = "bulkhead.rejected";
/// Rate limiter turned a caller away.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit.exceeded";
/// A failed attempt will be retried after a delay.
pub const RETRY_SCHEDULED: &str = "retry.scheduled";
/// A deadline elapsed before the guarded work completed.
pub const TIMEOUT_ELAPSED: &str = "timeout.elapsed";
/// A target policy was registered with the manager.
pub const TARGET_REGISTERED: &str = "target.registered";
/// A manager call ended with a protective error.
pub const CALL_REJECTED: &str = "call.rejected";

/// Returns the sink used when none is configured.
#[must_use]
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}
