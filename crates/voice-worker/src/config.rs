//! Worker configuration.
//!
//! Loaded from `WORKER_*` environment variables. The client secret is
//! redacted in Debug output.

use common::secret::SecretString;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default control node address.
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1:3000";

/// Default number of sessions the worker offers to hold.
pub const DEFAULT_MAX_SESSIONS: u32 = 15;

/// Default regions the worker accepts sessions for.
pub const DEFAULT_REGIONS: &str = "us-west,us-east";

/// Default `playback:progress` cadence.
pub const DEFAULT_PROGRESS_INTERVAL_SECONDS: u64 = 5;

/// Default delay before dialing the control node again.
pub const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 5;

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 15;

/// Regions the worker declares at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regions {
    All,
    Only(Vec<String>),
}

impl Regions {
    fn to_value(&self) -> Value {
        match self {
            Regions::All => json!("all"),
            Regions::Only(regions) => json!(regions),
        }
    }
}

/// Worker configuration.
#[derive(Clone)]
pub struct Config {
    /// Control node `host:port`.
    pub control_address: String,

    pub client_id: String,

    pub client_secret: SecretString,

    /// Declared capacity.
    pub max_sessions: u32,

    pub regions: Regions,

    /// How often a playing resource reports its position.
    pub progress_interval: Duration,

    /// Delay between a lost connection and the next dial.
    pub reconnect_delay: Duration,

    pub handshake_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("control_address", &self.control_address)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("max_sessions", &self.max_sessions)
            .field("regions", &self.regions)
            .field("progress_interval", &self.progress_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let client_id = vars
            .get("WORKER_CLIENT_ID")
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar("WORKER_CLIENT_ID".to_string()))?;

        let client_secret = vars
            .get("WORKER_CLIENT_SECRET")
            .filter(|secret| !secret.is_empty())
            .map(|secret| SecretString::from(secret.clone()))
            .ok_or_else(|| ConfigError::MissingEnvVar("WORKER_CLIENT_SECRET".to_string()))?;

        let control_address = vars
            .get("WORKER_CONTROL_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTROL_ADDRESS.to_string());

        let max_sessions = match vars.get("WORKER_MAX_SESSIONS") {
            Some(raw) => raw.parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue(format!("WORKER_MAX_SESSIONS must be a number: {e}"))
            })?,
            None => DEFAULT_MAX_SESSIONS,
        };

        let regions = parse_regions(
            vars.get("WORKER_REGIONS")
                .map_or(DEFAULT_REGIONS, String::as_str),
        )?;

        let progress_interval_seconds = vars
            .get("WORKER_PROGRESS_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECONDS);

        if progress_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "WORKER_PROGRESS_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let reconnect_delay_seconds = vars
            .get("WORKER_RECONNECT_DELAY_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_DELAY_SECONDS);

        let handshake_timeout_seconds = vars
            .get("WORKER_HANDSHAKE_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECONDS);

        Ok(Config {
            control_address,
            client_id,
            client_secret,
            max_sessions,
            regions,
            progress_interval: Duration::from_secs(progress_interval_seconds),
            reconnect_delay: Duration::from_secs(reconnect_delay_seconds),
            handshake_timeout: Duration::from_secs(handshake_timeout_seconds),
        })
    }

    /// Capability info sent at handshake.
    #[must_use]
    pub fn capability_info(&self) -> Value {
        json!({
            "max_sessions": self.max_sessions,
            "acceptable_regions": self.regions.to_value(),
        })
    }
}

fn parse_regions(raw: &str) -> Result<Regions, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("all") {
        return Ok(Regions::All);
    }

    let regions: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();

    if regions.is_empty() {
        return Err(ConfigError::InvalidValue(
            "WORKER_REGIONS must name at least one region or 'all'".to_string(),
        ));
    }
    Ok(Regions::Only(regions))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("WORKER_CLIENT_ID".to_string(), "1512".to_string()),
            ("WORKER_CLIENT_SECRET".to_string(), "hello_world".to_string()),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.control_address, DEFAULT_CONTROL_ADDRESS);
        assert_eq!(config.max_sessions, 15);
        assert_eq!(
            config.regions,
            Regions::Only(vec!["us-west".to_string(), "us-east".to_string()])
        );
        assert_eq!(config.progress_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_credentials() {
        let mut vars = base_vars();
        vars.remove("WORKER_CLIENT_SECRET");

        let err = Config::from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "WORKER_CLIENT_SECRET"));
    }

    #[test]
    fn test_capability_info_shape() {
        let mut vars = base_vars();
        vars.insert("WORKER_REGIONS".to_string(), "ALL".to_string());
        vars.insert("WORKER_MAX_SESSIONS".to_string(), "3".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(
            config.capability_info(),
            json!({"max_sessions": 3, "acceptable_regions": "all"})
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut vars = base_vars();
        vars.insert("WORKER_MAX_SESSIONS".to_string(), "many".to_string());
        assert!(Config::from_vars(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("WORKER_REGIONS".to_string(), " , ".to_string());
        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hello_world"));
    }
}
