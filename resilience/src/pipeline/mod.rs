//! Pipeline composition and the resilience manager.
//!
//! This module provides:
//! - Layer composition into a chain built once per target
//! - Per-target pipelines built from a policy
//! - The manager that routes calls by target name
//! - Health snapshots for the excluded HTTP surface

mod health;
mod layer;
mod manager;
mod target;


pub use health::{error_rate, HealthStatus, ServiceHealthSnapshot};
pub use layer::{compose, erase, restore, CallContext, ChainResult, Erased, ErasedOp, Next, PolicyLayer};
pub use manager::ResilienceManager;
pub use target::TargetPipeline;
