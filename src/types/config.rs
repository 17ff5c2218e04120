//! Configuration structures.
//!
//! Every section has working defaults; a host process may override them from
//! a JSON document. Component-level settings travel separately as a flattened
//! key/value map ([`ComponentSettings`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// RPC server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Liveness registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Connection pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Remote transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Distributed lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON configuration document. Missing sections take defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that break the liveness and locking timing assumptions.
    pub fn validate(&self) -> Result<()> {
        if self.registry.publish_interval >= self.registry.ttl {
            return Err(Error::server(format!(
                "registry.publish_interval ({:?}) must be shorter than registry.ttl ({:?})",
                self.registry.publish_interval, self.registry.ttl
            )));
        }
        if self.lock.max_retries == 0 {
            return Err(Error::server("lock.max_retries must be at least 1"));
        }
        if self.transport.call_timeout.is_zero() {
            return Err(Error::server("transport.call_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// RPC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    pub listen_addr: String,

    /// Endpoint published to discovery. Defaults to the bound address.
    pub advertise_endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7400".to_string(),
            advertise_endpoint: None,
        }
    }
}

/// Liveness registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expiry of each liveness entry.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Rewrite cadence; must stay below `ttl`.
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1),
            publish_interval: Duration::from_millis(500),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reconciliation period against discovery.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
        }
    }
}

/// Remote transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Fixed per-call deadline.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Dial deadline.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Client ping cadence on an otherwise idle connection.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// How long the client waits for a pong before failing the connection.
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Server closes a connection with no requests for this long.
    #[serde(with = "humantime_serde")]
    pub server_idle_timeout: Duration,

    /// Server retires a connection after this age.
    #[serde(with = "humantime_serde")]
    pub max_connection_age: Duration,

    /// In-flight calls get this long to finish after a retirement notice.
    #[serde(with = "humantime_serde")]
    pub max_connection_age_grace: Duration,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent inbound TCP connections.
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            server_idle_timeout: Duration::from_secs(15),
            max_connection_age: Duration::from_secs(30),
            max_connection_age_grace: Duration::from_secs(5),
            max_frame_bytes: 4 * 1024 * 1024,
            max_connections: 1000,
        }
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease of an acquired mutex.
    #[serde(with = "humantime_serde")]
    pub lease: Duration,

    /// Acquisition attempts before giving up.
    pub max_retries: u32,

    /// Spacing between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Namespace for lock keys in the shared store.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            max_retries: 600,
            retry_delay: Duration::from_millis(100),
            key_prefix: "lock:".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Flattened key/value configuration handed to each component at load time.
///
/// Nested documents are flattened to dotted keys: `{"room": {"open": true}}`
/// becomes `room.open = "true"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSettings(HashMap<String, String>);

impl ComponentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a JSON document into dotted keys. Arrays are joined with commas.
    pub fn flatten(value: &serde_json::Value) -> Self {
        let mut out = HashMap::new();
        flatten_into(&mut out, String::new(), value);
        Self(out)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Boolean lookup; anything other than `true`/`1` reads as false.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1"))
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(|e| Error::server(format!("invalid value for {}: {} ({})", key, raw, e))),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn flatten_into(out: &mut HashMap<String, String>, prefix: String, value: &serde_json::Value) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_into(out, key, v);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix, joined);
        }
        other => {
            out.insert(prefix, scalar_to_string(other));
        }
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
