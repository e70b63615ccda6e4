//! The composed pipeline of one target.

use std::fmt;
use std::sync::Arc;

use super::health::ServiceHealthSnapshot;
use futures::future::BoxFuture;

use super::layer::{compose, erase, restore, CallContext, Next, PolicyLayer};
use crate::config::PolicyConfig;
use crate::errors::ResilienceError;
use crate::events::EventSink;
use crate::policies::{Bulkhead, CacheAside, CircuitBreaker, RateLimiter, RetryPolicy, TimeoutGuard};

/// Mechanism instances built from one [`PolicyConfig`].
///
/// Layers run outermost first:
/// rate limiter, bulkhead, timeout, retry, circuit breaker, operation.
/// Absent sub-configs are skipped. The timeout wraps the retry layer, so it
/// bounds the whole retry sequence rather than each attempt.
pub struct TargetPipeline {
    name: String,
    config: PolicyConfig,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Arc<Bulkhead>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cache: Option<CacheAside<serde_json::Value>>,
    layers: Vec<PolicyLayer>,
    chain: Next,
}

impl TargetPipeline {
    /// Builds the mechanisms for `config`, each reporting to `sink`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: PolicyConfig, sink: &Arc<dyn EventSink>) -> Self {
        let name = name.into();

        let rate_limiter = config.rate_limiter.clone().map(|c| {
            Arc::new(RateLimiter::new(name.clone(), c).with_event_sink(sink.clone()))
        });
        let bulkhead = config
            .bulkhead
            .clone()
            .map(|c| Arc::new(Bulkhead::new(name.clone(), c).with_event_sink(sink.clone())));
        let timeout = config
            .timeout
            .as_ref()
            .map(|c| TimeoutGuard::new(name.clone(), c).with_event_sink(sink.clone()));
        let retry = config
            .retry
            .clone()
            .map(|c| Arc::new(RetryPolicy::new(name.clone(), c).with_event_sink(sink.clone())));
        let circuit_breaker = config.circuit_breaker.clone().map(|c| {
            Arc::new(CircuitBreaker::new(name.clone(), c).with_event_sink(sink.clone()))
        });
        let cache = config
            .cache
            .clone()
            .map(|c| CacheAside::new(name.clone(), c));

        let mut layers = Vec::with_capacity(5);
        if let Some(ref l) = rate_limiter {
            layers.push(PolicyLayer::RateLimit(l.clone()));
        }
        if let Some(ref b) = bulkhead {
            layers.push(PolicyLayer::Bulkhead(b.clone()));
        }
        if let Some(t) = timeout {
            layers.push(PolicyLayer::Timeout(t));
        }
        if let Some(r) = retry {
            layers.push(PolicyLayer::Retry(r));
        }
        if let Some(ref cb) = circuit_breaker {
            layers.push(PolicyLayer::CircuitBreaker(cb.clone()));
        }

        let chain = compose(&layers);

        Self {
            name,
            config,
            circuit_breaker,
            bulkhead,
            rate_limiter,
            cache,
            layers,
            chain,
        }
    }

    /// Returns the target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the policy the pipeline was built from.
    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Returns the layers, outermost first.
    #[must_use]
    pub fn layers(&self) -> &[PolicyLayer] {
        &self.layers
    }

    /// Returns the circuit breaker, if configured.
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_deref()
    }

    /// Returns the cache-aside store, if configured.
    #[must_use]
    pub const fn cache(&self) -> Option<&CacheAside<serde_json::Value>> {
        self.cache.as_ref()
    }

    /// Runs `op` through the target's chain, built once at construction.
    ///
    /// Each run gets its own scope derived from `ctx`, so a context may be
    /// reused across calls.
    pub async fn execute<T, F>(&self, op: F, ctx: &CallContext) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        F: Fn() -> BoxFuture<'static, Result<T, ResilienceError>> + Send + Sync + 'static,
    {
        restore((self.chain)(erase(op), ctx.for_call()).await)
    }

    /// Returns the target's health.
    #[must_use]
    pub fn health(&self) -> ServiceHealthSnapshot {
        let mut snapshot = ServiceHealthSnapshot::new(
            self.name.clone(),
            self.circuit_breaker.as_ref().map(|cb| cb.snapshot()),
        );
        snapshot.bulkhead = self.bulkhead.as_ref().map(|b| b.snapshot());
        snapshot.rate_limiter = self.rate_limiter.as_ref().map(|r| r.snapshot());
        snapshot.cache = self.cache.as_ref().map(CacheAside::stats);
        snapshot
    }
}

impl fmt::Debug for TargetPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layers: Vec<_> = self.layers.iter().map(PolicyLayer::name).collect();
        f.debug_struct("TargetPipeline")
            .field("name", &self.name)
            .field("layers", &layers)
            .finish_non_exhaustive()
    }
}
