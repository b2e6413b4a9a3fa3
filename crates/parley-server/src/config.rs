//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`PARLEY_CONFIG`, or the first of the default paths)
//! - Environment variables (`PARLEY__SECTION__KEY`, plus `PARLEY_HOST` and
//!   `PARLEY_PORT` for the listener)

use anyhow::{Context, Result};
use parley_transport::{EngineConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, searched in order.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Presence sweep configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable HTTP long-polling.
    #[serde(default = "default_true")]
    pub polling: bool,

    /// Enable WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path of the engine endpoint.
    #[serde(default = "default_engine_path")]
    pub path: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Pong deadline in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound payload in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,

    /// Outbound frames queued per session before sends are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. `~` is expanded.
    #[serde(default = "default_database")]
    pub database: String,

    /// Pool size.
    #[serde(default = "default_max_db_connections")]
    pub max_connections: u32,

    /// Deadline for each storage call made by a handler, in milliseconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

/// Presence sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sixty")]
    pub sweep_interval_secs: u64,

    /// Seconds without a heartbeat before an identity is swept offline.
    #[serde(default = "default_sixty")]
    pub stale_after_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_engine_path() -> String {
    "/socket.io/".to_string()
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    20_000
}

fn default_max_payload() -> usize {
    1_000_000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_database() -> String {
    "~/.local/share/parley/parley.db".to_string()
}

fn default_max_db_connections() -> u32 {
    8
}

fn default_call_timeout() -> u64 {
    5_000
}

fn default_sixty() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
            presence: PresenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            polling: true,
            websocket: true,
            path: default_engine_path(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            max_connections: default_max_db_connections(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sixty(),
            stale_after_secs: default_sixty(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `PARLEY__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PARLEY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var("PARLEY_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref()));
        }
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Database path with `~` expanded.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.database).as_ref())
    }

    /// Deadline applied to each handler storage call.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.call_timeout_ms)
    }

    /// Enabled transports, polling first.
    #[must_use]
    pub fn transports(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.transport.polling {
            kinds.push(TransportKind::Polling);
        }
        if self.transport.websocket {
            kinds.push(TransportKind::WebSocket);
        }
        kinds
    }

    /// Settings for the transport engine.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
            ping_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            max_payload: self.limits.max_payload,
            outbound_buffer: self.limits.outbound_buffer,
            transports: self.transports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.heartbeat.interval_ms, 25_000);
        assert_eq!(config.heartbeat.timeout_ms, 20_000);
        assert_eq!(config.storage.call_timeout_ms, 5_000);
        assert_eq!(config.presence.sweep_interval_secs, 60);
        assert_eq!(config.presence.stale_after_secs, 60);
        assert_eq!(config.transport.path, "/socket.io/");
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "0.0.0.0".into();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [heartbeat]
            interval_ms = 10000

            [storage]
            database = "/var/lib/parley/chat.db"

            [transport]
            polling = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat.interval_ms, 10_000);
        assert_eq!(config.heartbeat.timeout_ms, 20_000);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/parley/chat.db"));
        assert_eq!(config.transports(), vec![TransportKind::WebSocket]);
    }

    #[test]
    fn test_engine_config_follows_sections() {
        let mut config = Config::default();
        config.limits.max_payload = 4096;
        let engine = config.engine_config();
        assert_eq!(engine.ping_interval, Duration::from_secs(25));
        assert_eq!(engine.ping_timeout, Duration::from_secs(20));
        assert_eq!(engine.max_payload, 4096);
        assert_eq!(engine.transports.len(), 2);
    }
}
