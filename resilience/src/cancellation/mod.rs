//! Cooperative cancellation for pipeline calls.
//!
//! A [`CancellationToken`] handed to
//! [`ResilienceManager::execute_with_cancel`](crate::pipeline::ResilienceManager::execute_with_cancel)
//! aborts waiting in the bulkhead queue and the timeout guard. The protected
//! operation itself is never preempted.

mod token;

pub use token::CancellationToken;
