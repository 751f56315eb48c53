//! Control node configuration.
//!
//! Configuration is loaded from environment variables. Worker secrets are
//! redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default TCP bind address for worker connections.
pub const DEFAULT_RPC_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default bind address for health, metrics and admin routes.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default heartbeat interval announced to workers.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 15;

/// Default deadline for calls made through a remote proxy.
pub const DEFAULT_CALL_TIMEOUT_SECONDS: u64 = 10;

/// Default delay before a session retries worker binding.
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2000;

/// Default idle time before a session is evicted.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS: u64 = 300;

/// Default name reported to workers.
pub const DEFAULT_NODE_NAME: &str = "voice-relay";

/// Control node configuration.
#[derive(Clone)]
pub struct Config {
    /// Listener for worker connections (default: "0.0.0.0:3000").
    pub rpc_bind_address: String,

    /// Listener for health, metrics and admin routes (default: "0.0.0.0:8081").
    pub http_bind_address: String,

    /// Shared secrets keyed by worker client id.
    pub worker_credentials: HashMap<String, SecretString>,

    /// Ping interval negotiated to workers.
    pub heartbeat_interval: Duration,

    pub handshake_timeout: Duration,

    /// Deadline for each call made through a remote proxy.
    pub call_timeout: Duration,

    /// Delay between worker binding attempts.
    pub reconnect_backoff: Duration,

    /// How long a session may sit idle before it is halted and dropped.
    pub session_idle_timeout: Duration,

    /// Name returned by the `info` call.
    pub node_name: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut client_ids: Vec<&String> = self.worker_credentials.keys().collect();
        client_ids.sort();

        f.debug_struct("Config")
            .field("rpc_bind_address", &self.rpc_bind_address)
            .field("http_bind_address", &self.http_bind_address)
            .field("worker_client_ids", &client_ids)
            .field("worker_secrets", &"[REDACTED]")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .field("node_name", &self.node_name)
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
        let worker_credentials = parse_credentials(
            vars.get("CN_WORKER_CREDENTIALS")
                .ok_or_else(|| ConfigError::MissingEnvVar("CN_WORKER_CREDENTIALS".to_string()))?,
        )?;

        let rpc_bind_address = vars
            .get("CN_RPC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RPC_BIND_ADDRESS.to_string());

        let http_bind_address = vars
            .get("CN_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let heartbeat_interval_seconds = vars
            .get("CN_HEARTBEAT_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECONDS);

        // Workers receive the interval in whole seconds.
        if heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "CN_HEARTBEAT_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let handshake_timeout_seconds = vars
            .get("CN_HANDSHAKE_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECONDS);

        let call_timeout_seconds = vars
            .get("CN_CALL_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECONDS);

        let reconnect_backoff_ms = vars
            .get("CN_RECONNECT_BACKOFF_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS);

        let session_idle_timeout_seconds = vars
            .get("CN_SESSION_IDLE_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS);

        let node_name = vars
            .get("CN_NODE_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string());

        Ok(Config {
            rpc_bind_address,
            http_bind_address,
            worker_credentials,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_seconds),
            handshake_timeout: Duration::from_secs(handshake_timeout_seconds),
            call_timeout: Duration::from_secs(call_timeout_seconds),
            reconnect_backoff: Duration::from_millis(reconnect_backoff_ms),
            session_idle_timeout: Duration::from_secs(session_idle_timeout_seconds),
            node_name,
        })
    }
}

/// Parse `id=secret` pairs separated by commas.
fn parse_credentials(raw: &str) -> Result<HashMap<String, SecretString>, ConfigError> {
    let mut credentials = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (client_id, secret) = entry.split_once('=').ok_or_else(|| {
            ConfigError::InvalidValue(
                "CN_WORKER_CREDENTIALS entries must look like id=secret".to_string(),
            )
        })?;

        let client_id = client_id.trim();
        if client_id.is_empty() || secret.is_empty() {
            return Err(ConfigError::InvalidValue(
                "CN_WORKER_CREDENTIALS has an empty id or secret".to_string(),
            ));
        }

        if credentials
            .insert(client_id.to_string(), SecretString::from(secret.to_string()))
            .is_some()
        {
            return Err(ConfigError::InvalidValue(format!(
                "CN_WORKER_CREDENTIALS lists client id '{client_id}' twice"
            )));
        }
    }

    if credentials.is_empty() {
        return Err(ConfigError::InvalidValue(
            "CN_WORKER_CREDENTIALS must contain at least one worker".to_string(),
        ));
    }

    Ok(credentials)
}
