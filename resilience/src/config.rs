//! Declarative per-target policy configuration.
//!
//! A [`PolicyConfig`] holds one optional sub-config per mechanism. A missing
//! sub-config means the corresponding layer is skipped for that target.
//! All durations are expressed in milliseconds so configs round-trip through
//! JSON without custom codecs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ConfigError;

/// Error kinds retried by default: transient network and timeout failures.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "temporarily unavailable",
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "EPIPE",
    "EAI_AGAIN",
];

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe, in milliseconds.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a new circuit breaker config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub fn with_reset_timeout_ms(mut self, timeout: u64) -> Self {
        self.reset_timeout_ms = timeout;
        self
    }

    /// Sets the half-open success threshold.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Returns the reset timeout as a duration.
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be > 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be > 0",
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.reset_timeout_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the un-jittered delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Maximum jitter as a fraction of the delay.
    pub jitter_ratio: f64,
    /// Error kinds considered transient by the default retry predicate.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.1,
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Replaces the retryable error allow-list.
    #[must_use]
    pub fn with_retryable_errors<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be > 0"));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                "must be a positive number",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::invalid(
                "retry.jitter_ratio",
                "must be within [0, 1]",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must be >= base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Operations allowed to run at the same time.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot.
    pub max_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 100,
        }
    }
}

impl BulkheadConfig {
    /// Creates a bulkhead config with the given limits.
    #[must_use]
    pub const fn new(max_concurrent: usize, max_queue: usize) -> Self {
        Self {
            max_concurrent,
            max_queue,
        }
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "bulkhead.max_concurrent",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 1_000,
        }
    }
}

impl RateLimiterConfig {
    /// Creates a rate limiter config.
    #[must_use]
    pub const fn new(max_requests: usize, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    /// Returns the window as a duration.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid(
                "rate_limiter.max_requests",
                "must be > 0",
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid("rate_limiter.window_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for the whole guarded call, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl TimeoutConfig {
    /// Creates a timeout config.
    #[must_use]
    pub const fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }

    /// Returns the deadline as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("timeout.timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Cache-aside configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Maximum number of entries.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_size: 1_000,
        }
    }
}

impl CacheConfig {
    /// Creates a cache config.
    #[must_use]
    pub const fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self { ttl_ms, max_size }
    }

    /// Returns the ttl as a duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Checks the config for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("cache.max_size", "must be > 0"));
        }
        Ok(())
    }
}

/// Policy for one target. Each `None` layer is skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Circuit breaker layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Retry layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Bulkhead layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    /// Rate limiter layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Timeout layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
    /// Cache-aside store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

impl PolicyConfig {
    /// Creates an empty policy (pass-through).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the circuit breaker layer.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets the retry layer.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Sets the bulkhead layer.
    #[must_use]
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Sets the rate limiter layer.
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    /// Sets the timeout layer.
    #[must_use]
    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    /// Sets the cache-aside store.
    #[must_use]
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Validates every configured sub-config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref c) = self.circuit_breaker {
            c.validate()?;
        }
        if let Some(ref c) = self.retry {
            c.validate()?;
        }
        if let Some(ref c) = self.bulkhead {
            c.validate()?;
        }
        if let Some(ref c) = self.rate_limiter {
            c.validate()?;
        }
        if let Some(ref c) = self.timeout {
            c.validate()?;
        }
        if let Some(ref c) = self.cache {
            c.validate()?;
        }
        Ok(())
    }
}

/// Startup configuration for the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Policies keyed by target name.
    pub targets: HashMap<String, PolicyConfig>,
    /// Policy used to build unknown targets on first use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<PolicyConfig>,
}

impl ManagerConfig {
    /// Creates an empty manager config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target policy.
    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>, policy: PolicyConfig) -> Self {
        self.targets.insert(name.into(), policy);
        self
    }

    /// Sets the default policy.
    #[must_use]
    pub fn with_default_policy(mut self, policy: PolicyConfig) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every target policy and the default policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in &self.targets {
            if name.is_empty() {
                return Err(ConfigError::invalid("targets", "target name must not be empty"));
            }
            policy.validate().map_err(|e| match e {
                ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                    field: format!("targets.{name}.{field}"),
                    reason,
                },
                other => other,
            })?;
        }
        if let Some(ref policy) = self.default_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let cb = CircuitBreakerConfig::default();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 3);
        assert_eq!(cb.reset_timeout(), Duration::from_secs(60));

        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay_ms, 100);
        assert!(retry.retryable_errors.iter().any(|k| k == "ECONNRESET"));
    }

    #[test]
    fn test_policy_builder() {
        let policy = PolicyConfig::new()
            .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(2))
            .with_bulkhead(BulkheadConfig::new(4, 8))
            .with_timeout(TimeoutConfig::new(250));

        assert_eq!(policy.circuit_breaker.as_ref().map(|c| c.failure_threshold), Some(2));
        assert_eq!(policy.bulkhead, Some(BulkheadConfig::new(4, 8)));
        assert!(policy.retry.is_none());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let policy = PolicyConfig::new().with_retry(RetryConfig::new().with_max_attempts(0));
        assert_eq!(
            policy.validate(),
            Err(ConfigError::invalid("retry.max_attempts", "must be > 0"))
        );

        let policy = PolicyConfig::new().with_bulkhead(BulkheadConfig::new(0, 1));
        assert!(policy.validate().is_err());

        let policy = PolicyConfig::new().with_rate_limiter(RateLimiterConfig::new(5, 0));
        assert!(policy.validate().is_err());

        let policy = PolicyConfig::new().with_retry(RetryConfig::new().with_jitter_ratio(1.5));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_manager_config_from_json() {
        let json = r#"{
            "targets": {
                "payment-api": {
                    "circuit_breaker": { "failure_threshold": 3 },
                    "retry": { "max_attempts": 4, "base_delay_ms": 50 },
                    "bulkhead": { "max_concurrent": 2, "max_queue": 1 },
                    "timeout": { "timeout_ms": 1500 }
                },
                "catalog": {
                    "cache": { "ttl_ms": 30000 }
                }
            }
        }"#;

        let config = ManagerConfig::from_json_str(json).unwrap();
        let payment = &config.targets["payment-api"];

        let cb = payment.circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.failure_threshold, 3);
        assert_eq!(cb.success_threshold, 3);
        assert_eq!(payment.retry.as_ref().unwrap().max_attempts, 4);
        assert_eq!(payment.timeout, Some(TimeoutConfig::new(1500)));
        assert!(payment.rate_limiter.is_none());

        let catalog = &config.targets["catalog"];
        assert_eq!(catalog.cache, Some(CacheConfig::new(30_000, 1_000)));
    }

    #[test]
    fn test_manager_config_reports_target_path() {
        let json = r#"{ "targets": { "search": { "timeout": { "timeout_ms": 0 } } } }"#;
        let err = ManagerConfig::from_json_str(json).unwrap_err();
        assert_eq!(
            err,
            ConfigError::invalid("targets.search.timeout.timeout_ms", "must be > 0")
        );
    }

    #[test]
    fn test_manager_config_parse_error() {
        let err = ManagerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
