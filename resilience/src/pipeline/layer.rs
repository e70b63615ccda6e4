//! Layer composition.
//!
//! A target's chain is a single [`Next`] built once from its layers and
//! reused for every call. Each call hands the chain a type-erased
//! [`ErasedOp`] and a fresh [`CallContext`]; the chain passes both down to
//! the layer beneath it. Retry invokes the layer beneath it once per
//! attempt, which is why operations are `Fn` and not `FnOnce`.

use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::errors::ResilienceError;
use crate::policies::{Bulkhead, CircuitBreaker, RateLimiter, RetryPolicy, TimeoutGuard};

/// A successful result with its type erased.
pub type Erased = Box<dyn Any + Send>;

/// Result flowing through the chain.
pub type ChainResult = Result<Erased, ResilienceError>;

/// The protected operation with its result type erased.
pub type ErasedOp = Arc<dyn Fn() -> BoxFuture<'static, ChainResult> + Send + Sync>;

/// A composed call path.
pub type Next = Arc<dyn Fn(ErasedOp, CallContext) -> BoxFuture<'static, ChainResult> + Send + Sync>;

/// Per-call state threaded through the layers.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Caller's cancellation signal.
    pub cancel: Option<Arc<CancellationToken>>,
    /// Cancelled when the caller has been answered early (deadline elapsed
    /// or caller cancelled) while work beneath the timeout is still running.
    scope: Arc<CancellationToken>,
}

impl CallContext {
    /// Creates a context carrying `token`.
    #[must_use]
    pub fn with_cancel(token: Arc<CancellationToken>) -> Self {
        Self {
            cancel: Some(token),
            scope: Arc::default(),
        }
    }

    /// Returns true if the caller has already cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Returns the scope of this call.
    #[must_use]
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Copy of this context with a fresh scope, for one run of the chain.
    #[must_use]
    pub fn for_call(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            scope: Arc::default(),
        }
    }
}

/// Erases the result type of `op`.
pub fn erase<T, F>(op: F) -> ErasedOp
where
    T: Send + 'static,
    F: Fn() -> BoxFuture<'static, Result<T, ResilienceError>> + Send + Sync + 'static,
{
    Arc::new(move || -> BoxFuture<'static, ChainResult> {
        let fut = op();
        Box::pin(async move { fut.await.map(|value| Box::new(value) as Erased) })
    })
}

/// Recovers the result type erased by [`erase`].
pub fn restore<T: 'static>(result: ChainResult) -> Result<T, ResilienceError> {
    result?
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| ResilienceError::Operation(anyhow::anyhow!("chain returned an unexpected result type")))
}

/// One protective layer of a target's pipeline.
#[derive(Debug, Clone)]
pub enum PolicyLayer {
    /// Sliding-window admission.
    RateLimit(Arc<RateLimiter>),
    /// Concurrency limit with a wait queue.
    Bulkhead(Arc<Bulkhead>),
    /// Deadline over everything beneath it.
    Timeout(TimeoutGuard),
    /// Bounded retries.
    Retry(Arc<RetryPolicy>),
    /// Fail-fast on a failing target.
    CircuitBreaker(Arc<CircuitBreaker>),
}

impl PolicyLayer {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "rate_limit",
            Self::Bulkhead(_) => "bulkhead",
            Self::Timeout(_) => "timeout",
            Self::Retry(_) => "retry",
            Self::CircuitBreaker(_) => "circuit_breaker",
        }
    }

    /// Wraps `next` in this layer.
    #[must_use]
    pub fn wrap(&self, next: Next) -> Next {
        match self {
            Self::RateLimit(limiter) => {
                let limiter = limiter.clone();
                Arc::new(move |op: ErasedOp, ctx: CallContext| -> BoxFuture<'static, ChainResult> {
                    let limiter = limiter.clone();
                    let next = next.clone();
                    Box::pin(async move { limiter.execute(move || next(op, ctx)).await })
                })
            }
            Self::Bulkhead(bulkhead) => {
                let bulkhead = bulkhead.clone();
                Arc::new(move |op: ErasedOp, ctx: CallContext| -> BoxFuture<'static, ChainResult> {
                    let bulkhead = bulkhead.clone();
                    let next = next.clone();
                    let cancel = ctx.cancel.clone();
                    Box::pin(async move {
                        bulkhead
                            .execute_cancellable(move || next(op, ctx), cancel.as_deref())
                            .await
                    })
                })
            }
            Self::Timeout(guard) => {
                let guard = guard.clone();
                Arc::new(move |op: ErasedOp, ctx: CallContext| -> BoxFuture<'static, ChainResult> {
                    let guard = guard.clone();
                    let fut = next(op, ctx.clone());
                    Box::pin(async move {
                        let result = guard.execute_cancellable(fut, ctx.cancel.as_deref()).await;
                        match &result {
                            Err(ResilienceError::Timeout { .. }) => ctx.scope.cancel("deadline elapsed"),
                            Err(ResilienceError::Cancelled { reason, .. }) => {
                                ctx.scope.cancel(reason.clone());
                            }
                            _ => {}
                        }
                        result
                    })
                })
            }
            Self::Retry(policy) => {
                let policy = policy.clone();
                Arc::new(move |op: ErasedOp, ctx: CallContext| -> BoxFuture<'static, ChainResult> {
                    let policy = policy.clone();
                    let next = next.clone();
                    Box::pin(async move {
                        policy
                            .execute_cancellable(|| next(op.clone(), ctx.clone()), Some(ctx.scope()))
                            .await
                    })
                })
            }
            Self::CircuitBreaker(breaker) => {
                let breaker = breaker.clone();
                Arc::new(move |op: ErasedOp, ctx: CallContext| -> BoxFuture<'static, ChainResult> {
                    let breaker = breaker.clone();
                    let next = next.clone();
                    Box::pin(async move { breaker.execute(move || next(op, ctx)).await })
                })
            }
        }
    }
}

/// Builds the chain for `layers`, listed outermost first.
#[must_use]
pub fn compose(layers: &[PolicyLayer]) -> Next {
    let innermost: Next = Arc::new(|op: ErasedOp, _ctx: CallContext| op());
    layers
        .iter()
        .rev()
        .fold(innermost, |next, layer| layer.wrap(next))
}
