//! Common configuration types for Voice Relay components.
//!
//! Both binaries share the same logging bootstrap: an `EnvFilter` taken from
//! `RUST_LOG` (falling back to a per-binary default) and either a human or a
//! JSON formatting layer.

use std::collections::HashMap;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    Pretty,
    /// JSON objects, one per line (for log shippers).
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Output format (`RELAY_LOG_FORMAT=json` selects JSON).
    pub format: LogFormat,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

impl ObservabilityConfig {
    /// Build from environment-style variables.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>, default_filter: &str) -> Self {
        let format = match vars.get("RELAY_LOG_FORMAT").map(String::as_str) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            default_filter: default_filter.to_string(),
            format,
        }
    }

    /// Install the global tracing subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init_tracing(&self) -> Result<(), LoggingError> {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| self.default_filter.clone().into());

        let registry = tracing_subscriber::registry().with(filter);

        match self.format {
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        }
        .map_err(|e| LoggingError::Install(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_format_selected_by_env() {
        let vars = HashMap::from([("RELAY_LOG_FORMAT".to_string(), "json".to_string())]);
        let config = ObservabilityConfig::from_vars(&vars, "control_node=debug");

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_filter, "control_node=debug");
    }

    #[test]
    fn test_pretty_is_default() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "voice_worker=info");
        assert_eq!(config.format, LogFormat::Pretty);
    }
}
