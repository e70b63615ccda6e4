//! Testing utilities for resilience pipelines.
//!
//! This module provides:
//! - Scripted operations that replay a fixed sequence of outcomes
//! - Transient and permanent error types for exercising retry predicates

mod errors;
mod operations;

pub use errors::{PermanentError, TransientError};
pub use operations::{Outcome, ScriptedOperation};
