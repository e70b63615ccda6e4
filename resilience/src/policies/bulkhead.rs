//! Concurrency bulkhead with a bounded FIFO wait queue.
//!
//! A caller is admitted while fewer than `max_concurrent` operations run.
//! Otherwise it waits in the queue if there is room, or is rejected with
//! [`ResilienceError::BulkheadFull`]. When a running operation finishes, its
//! slot is handed directly to the oldest live waiter, which then runs its own
//! operation. A caller is never both running and queued.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::config::BulkheadConfig;
use crate::errors::ResilienceError;
use crate::events::{self, EventSink};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    running: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    total_admitted: u64,
    total_rejected: u64,
}

impl SlotState {
    /// Hands a finished caller's slot to the oldest live waiter, or frees it.
    fn release(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                self.total_admitted += 1;
                return;
            }
        }
        self.running = self.running.saturating_sub(1);
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadSnapshot {
    /// Operations currently running.
    pub running: usize,
    /// Callers waiting for a slot.
    pub queued: usize,
    /// Configured concurrency limit.
    pub max_concurrent: usize,
    /// Configured queue capacity.
    pub max_queue: usize,
    /// Callers admitted since creation.
    pub total_admitted: u64,
    /// Callers rejected since creation.
    pub total_rejected: u64,
}

enum Admission {
    Granted,
    Queued(u64, oneshot::Receiver<()>),
    Rejected,
}

/// Per-target bulkhead.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    state: Mutex<SlotState>,
    sink: Arc<dyn EventSink>,
}

impl Bulkhead {
    /// Creates a bulkhead for the named target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(SlotState::default()),
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
    pub const fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Runs `op` once a slot is available.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.execute_cancellable(op, None).await
    }

    /// Runs `op` once a slot is available. Cancelling `cancel` while the
    /// caller is queued removes it from the queue and returns
    /// [`ResilienceError::Cancelled`].
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        op: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let _permit = self.acquire(cancel).await?;
        op().await
    }

    /// Waits for a slot. The slot is held until the returned permit drops.
    pub async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit<'_>, ResilienceError> {
        let admission = {
            let mut s = self.state.lock();
            if s.running < self.config.max_concurrent {
                s.running += 1;
                s.total_admitted += 1;
                Admission::Granted
            } else {
                s.waiters.retain(|w| !w.tx.is_closed());
                if s.waiters.len() < self.config.max_queue {
                    let (tx, rx) = oneshot::channel();
                    let id = s.next_waiter_id;
                    s.next_waiter_id += 1;
                    s.waiters.push_back(Waiter { id, tx });
                    Admission::Queued(id, rx)
                } else {
                    s.total_rejected += 1;
                    Admission::Rejected
                }
            }
        };

        match admission {
            Admission::Granted => Ok(BulkheadPermit { bulkhead: self }),
            Admission::Queued(id, rx) => {
                debug!(target_name = %self.name, waiter = id, "Bulkhead full, queued");
                let mut waiter = QueuedWaiter {
                    bulkhead: self,
                    id,
                    rx: Some(rx),
                };
                waiter.wait(cancel).await
            }
            Admission::Rejected => {
                warn!(
                    target_name = %self.name,
                    max_concurrent = self.config.max_concurrent,
                    max_queue = self.config.max_queue,
                    "Bulkhead rejected call"
                );
                self.sink.try_emit(
                    events::BULKHEAD_REJECTED,
                    Some(serde_json::json!({
                        "target": self.name,
                        "max_concurrent": self.config.max_concurrent,
                        "max_queue": self.config.max_queue,
                    })),
                );
                Err(ResilienceError::BulkheadFull {
                    target: self.name.clone(),
                    max_concurrent: self.config.max_concurrent,
                    max_queue: self.config.max_queue,
                })
            }
        }
    }

    /// Returns a snapshot of the bulkhead.
    #[must_use]
    pub fn snapshot(&self) -> BulkheadSnapshot {
        let s = self.state.lock();
        BulkheadSnapshot {
            running: s.running,
            queued: s.live_waiters(),
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue,
            total_admitted: s.total_admitted,
            total_rejected: s.total_rejected,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// A held bulkhead slot, released on drop.
#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.state.lock().release();
    }
}

/// A queued caller. Leaving the queue early (cancel or drop) goes through
/// [`QueuedWaiter::abandon`], which runs under the state lock so a slot handed
/// over concurrently is passed on instead of leaked.
struct QueuedWaiter<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl<'a> QueuedWaiter<'a> {
    async fn wait(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit<'a>, ResilienceError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(self.cancelled("waiter already completed".to_string()));
        };

        let granted = match cancel {
            Some(token) => {
                tokio::select! {
                    res = rx => res.is_ok(),
                    () = token.cancelled() => false,
                }
            }
            None => rx.await.is_ok(),
        };

        if granted {
            self.rx = None;
            return Ok(BulkheadPermit {
                bulkhead: self.bulkhead,
            });
        }

        self.abandon();
        let reason = cancel
            .and_then(CancellationToken::reason)
            .unwrap_or_else(|| "bulkhead wait aborted".to_string());
        debug!(target_name = %self.bulkhead.name, waiter = self.id, %reason, "Left bulkhead queue");
        Err(self.cancelled(reason))
    }

    fn abandon(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut s = self.bulkhead.state.lock();
        rx.close();
        if rx.try_recv().is_ok() {
            s.release();
        } else {
            let id = self.id;
            s.waiters.retain(|w| w.id != id);
        }
    }

    fn cancelled(&self, reason: String) -> ResilienceError {
        ResilienceError::Cancelled {
            target: self.bulkhead.name.clone(),
            reason,
        }
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}
