//! Registry of target pipelines and the single call entry point.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::health::ServiceHealthSnapshot;
use super::layer::CallContext;
use super::target::TargetPipeline;
use crate::cancellation::CancellationToken;
use crate::config::{ManagerConfig, PolicyConfig};
use crate::errors::{ConfigError, ResilienceError};
use crate::events::{self, EventSink};
use crate::observability::SpanTimer;

const CALL_SPAN: &str = "resilience.call";

/// Owns one [`TargetPipeline`] per named downstream dependency.
///
/// Targets are independent: no state or lock is shared between them.
/// A name without a registered policy is built from the default policy on
/// first use, or rejected with [`ResilienceError::UnknownTarget`] when there
/// is none.
pub struct ResilienceManager {
    pipelines: DashMap<String, Arc<TargetPipeline>>,
    default_policy: Option<PolicyConfig>,
    sink: Arc<dyn EventSink>,
}

impl ResilienceManager {
    /// Validates `config` and builds every configured target.
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let sink = events::noop_sink();
        let pipelines = DashMap::new();
        for (name, policy) in config.targets {
            let pipeline = TargetPipeline::new(name.clone(), policy, &sink);
            pipelines.insert(name, Arc::new(pipeline));
        }

        Ok(Self {
            pipelines,
            default_policy: config.default_policy,
            sink,
        })
    }

    /// Sets the sink for manager and mechanism events.
    ///
    /// Registered targets are rebuilt with fresh state, so call this before
    /// serving traffic.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let rebuilt = DashMap::new();
        for entry in &self.pipelines {
            let pipeline = TargetPipeline::new(entry.key().clone(), entry.config().clone(), &sink);
            rebuilt.insert(entry.key().clone(), Arc::new(pipeline));
        }
        self.pipelines = rebuilt;
        self.sink = sink;
        self
    }

    /// Registers or replaces a target.
    ///
    /// Replacing discards the previous breaker, bulkhead, limiter and cache
    /// state. Calls already in flight finish on the old pipeline.
    pub fn register_target(
        &self,
        name: impl Into<String>,
        config: PolicyConfig,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::invalid("targets", "target name must not be empty"));
        }
        config.validate()?;

        let pipeline = TargetPipeline::new(name.clone(), config, &self.sink);
        let layers: Vec<&str> = pipeline.layers().iter().map(|l| l.name()).collect();
        let replaced = self.pipelines.insert(name.clone(), Arc::new(pipeline)).is_some();

        info!(target_name = %name, ?layers, replaced, "Target registered");
        self.sink.try_emit(
            events::TARGET_REGISTERED,
            Some(serde_json::json!({
                "target": name,
                "layers": layers,
                "replaced": replaced,
            })),
        );
        Ok(())
    }

    /// Returns the registered target names, sorted.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the pipeline for `target`, building it from the default policy
    /// if needed.
    pub fn pipeline(&self, target: &str) -> Result<Arc<TargetPipeline>, ResilienceError> {
        if let Some(existing) = self.pipelines.get(target) {
            return Ok(existing.value().clone());
        }

        let Some(ref policy) = self.default_policy else {
            return Err(ResilienceError::UnknownTarget(target.to_string()));
        };

        let pipeline = self
            .pipelines
            .entry(target.to_string())
            .or_insert_with(|| {
                info!(target_name = %target, "Building target from default policy");
                Arc::new(TargetPipeline::new(target, policy.clone(), &self.sink))
            })
            .value()
            .clone();
        Ok(pipeline)
    }

    /// Runs `op` through the target's pipeline.
    ///
    /// The operation's own failure comes back as
    /// [`ResilienceError::Operation`]; every other variant means a protective
    /// layer stopped or cut short the call.
    pub async fn execute<T, E, F, Fut>(&self, target: &str, op: F) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run(target, op, CallContext::default()).await
    }

    /// Like [`ResilienceManager::execute`], giving up with
    /// [`ResilienceError::Cancelled`] when `token` fires while the call waits
    /// in the bulkhead queue or runs under the timeout guard.
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        target: &str,
        token: Arc<CancellationToken>,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run(target, op, CallContext::with_cancel(token)).await
    }

    /// Serves `key` from the target's cache, running `op` through the
    /// pipeline on a miss. Targets without a cache always run `op`.
    ///
    /// Only successful results are cached.
    pub async fn execute_cached<T, E, F, Fut>(
        &self,
        target: &str,
        key: &str,
        op: F,
    ) -> Result<T, ResilienceError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let pipeline = self.pipeline(target)?;
        let Some(cache) = pipeline.cache() else {
            return self.run(target, op, CallContext::default()).await;
        };

        if let Some(cached) = cache.lookup(key) {
            debug!(target_name = %target, key, "Cache hit");
            return serde_json::from_value(cached)
                .map_err(|e| ResilienceError::Serialization(e.to_string()));
        }

        let value = self.run(target, op, CallContext::default()).await?;
        let json =
            serde_json::to_value(&value).map_err(|e| ResilienceError::Serialization(e.to_string()))?;
        cache.insert(key, json);
        Ok(value)
    }

    async fn run<T, E, F, Fut>(
        &self,
        target: &str,
        op: F,
        ctx: CallContext,
    ) -> Result<T, ResilienceError>
    where
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let pipeline = self.pipeline(target)?;
        let call_id = Uuid::new_v4();
        let span = info_span!(CALL_SPAN, target_name = %target, %call_id);

        async move {
            if ctx.is_cancelled() {
                let reason = ctx
                    .cancel
                    .as_ref()
                    .and_then(|t| t.reason())
                    .unwrap_or_else(|| "cancelled".to_string());
                return Err(ResilienceError::Cancelled {
                    target: target.to_string(),
                    reason,
                });
            }

            let call = move || -> BoxFuture<'static, Result<T, ResilienceError>> {
                let fut = op();
                Box::pin(async move { fut.await.map_err(|e| ResilienceError::Operation(e.into())) })
            };

            let timer = SpanTimer::start(CALL_SPAN);
            let result = pipeline.execute(call, &ctx).await;
            let elapsed_ms = timer.elapsed_ms();

            let rejection = match &result {
                Ok(_) => {
                    debug!(elapsed_ms, "Call succeeded");
                    None
                }
                Err(e) if e.is_protective() => {
                    warn!(kind = %e.kind(), error = %e, elapsed_ms, "Call rejected");
                    Some(serde_json::json!({
                        "target": target,
                        "call_id": call_id.to_string(),
                        "kind": e.kind().as_str(),
                        "error": e.to_string(),
                        "elapsed_ms": elapsed_ms,
                    }))
                }
                Err(e) => {
                    debug!(error = %e, elapsed_ms, "Call failed");
                    None
                }
            };
            if let Some(data) = rejection {
                self.sink.emit(events::CALL_REJECTED, Some(data)).await;
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Returns the health of a registered target.
    pub fn get_health(&self, target: &str) -> Result<ServiceHealthSnapshot, ResilienceError> {
        self.pipelines
            .get(target)
            .map(|p| p.health())
            .ok_or_else(|| ResilienceError::UnknownTarget(target.to_string()))
    }

    /// Returns the health of every registered target, sorted by name.
    #[must_use]
    pub fn get_all_health(&self) -> Vec<ServiceHealthSnapshot> {
        let mut all: Vec<_> = self.pipelines.iter().map(|p| p.health()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    /// Forces the target's breaker closed. Returns false if it has none.
    pub fn reset_circuit(&self, target: &str) -> Result<bool, ResilienceError> {
        let pipeline = self.registered(target)?;
        match pipeline.circuit_breaker() {
            Some(cb) => {
                cb.reset();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops `key` from the target's cache. Returns true if it was cached.
    pub fn invalidate_cache(&self, target: &str, key: &str) -> Result<bool, ResilienceError> {
        let pipeline = self.registered(target)?;
        Ok(pipeline.cache().is_some_and(|c| c.invalidate(key)))
    }

    /// Empties the target's cache.
    pub fn clear_cache(&self, target: &str) -> Result<(), ResilienceError> {
        let pipeline = self.registered(target)?;
        if let Some(cache) = pipeline.cache() {
            cache.clear();
            info!(target_name = %target, "Cache cleared");
        }
        Ok(())
    }

    fn registered(&self, target: &str) -> Result<Arc<TargetPipeline>, ResilienceError> {
        self.pipelines
            .get(target)
            .map(|p| p.value().clone())
            .ok_or_else(|| ResilienceError::UnknownTarget(target.to_string()))
    }
}

impl fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("targets", &self.targets())
            .field("has_default_policy", &self.default_policy.is_some())
            .finish_non_exhaustive()
    }
}
