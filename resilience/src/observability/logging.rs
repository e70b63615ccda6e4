//! Global `tracing` subscriber setup.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `resilience=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Creates a config with the given filter directives.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Switches to JSON output.
    #[must_use]
    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }
}

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TracingInitError {
    /// The configured directives do not parse.
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter {
        /// The rejected directives.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// Another global subscriber is already installed.
    #[error("Failed to install tracing subscriber: {0}")]
    AlreadyInstalled(String),
}

/// Installs the global fmt subscriber described by `config`.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TracingInitError> {
    let configured =
        EnvFilter::try_new(&config.level).map_err(|e| TracingInitError::InvalidFilter {
            filter: config.level.clone(),
            reason: e.to_string(),
        })?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.map_err(|e| TracingInitError::AlreadyInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"format": "json"}"#).unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(LoggingConfig::new("debug").json().format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let err = init_tracing(&LoggingConfig::new("resilience=loud")).unwrap_err();
        assert!(matches!(err, TracingInitError::InvalidFilter { .. }));
    }

    #[test]
    fn test_second_install_fails_without_panicking() {
        let config = LoggingConfig::new("warn");
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(TracingInitError::AlreadyInstalled(_))
        ));
    }
}
