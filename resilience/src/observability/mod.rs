//! Observability utilities.

mod logging;
mod timer;

pub use logging::{init_tracing, LogFormat, LoggingConfig, TracingInitError};
pub use timer::SpanTimer;
