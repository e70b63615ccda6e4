//! Per-target health snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::policies::{
    BulkheadSnapshot, CacheStats, CircuitSnapshot, CircuitState, RateLimiterSnapshot,
};

/// Coarse health of a target, derived from its circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Closed breaker with no recent failures, or no breaker at all.
    Healthy,
    /// Half-open breaker, or closed with failures counted.
    Degraded,
    /// Open breaker.
    Unhealthy,
}

impl HealthStatus {
    /// Derives the status from a breaker snapshot.
    #[must_use]
    pub fn from_circuit(circuit: Option<&CircuitSnapshot>) -> Self {
        match circuit {
            None => Self::Healthy,
            Some(c) => match c.state {
                CircuitState::Open => Self::Unhealthy,
                CircuitState::HalfOpen => Self::Degraded,
                CircuitState::Closed if c.failure_count > 0 => Self::Degraded,
                CircuitState::Closed => Self::Healthy,
            },
        }
    }

    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `failures / (failures + successes)`, or 0 when both are zero.
#[must_use]
pub fn error_rate(failures: u32, successes: u32) -> f64 {
    let total = u64::from(failures) + u64::from(successes);
    if total == 0 {
        0.0
    } else {
        f64::from(failures) / total as f64
    }
}

/// Health of one target, with the snapshots of whatever layers it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthSnapshot {
    /// Target name.
    pub target: String,
    /// Derived status.
    pub status: HealthStatus,
    /// Failure ratio over the breaker's current counters.
    pub error_rate: f64,
    /// Breaker state and counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitSnapshot>,
    /// Bulkhead occupancy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadSnapshot>,
    /// Rate limiter window usage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterSnapshot>,
    /// Cache counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

impl ServiceHealthSnapshot {
    /// Builds a snapshot, deriving status and error rate from `circuit`.
    #[must_use]
    pub fn new(target: impl Into<String>, circuit: Option<CircuitSnapshot>) -> Self {
        let status = HealthStatus::from_circuit(circuit.as_ref());
        let error_rate = circuit
            .as_ref()
            .map_or(0.0, |c| error_rate(c.failure_count, c.success_count));
        Self {
            target: target.into(),
            status,
            error_rate,
            circuit,
            bulkhead: None,
            rate_limiter: None,
            cache: None,
            generated_at: Utc::now(),
        }
    }

    /// Returns true if the status is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
