//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PODRELAY_LISTEN`, `PORT` (listen port
//!    only), `PODRELAY_LOG_LEVEL`. `KUBECONFIG` is honoured by the
//!    Kubernetes client itself when `[kube] kubeconfig` is unset.
//! 2. **Config file**: path via `--config <path>`, or `podrelay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_connections = 256        # concurrent HTTP requests
//! max_sessions = 64            # live port-forwards + log streams
//!
//! [portforward]
//! bind_address = "127.0.0.1"
//! max_connections_per_session = 32
//! connect_timeout_ms = 10000
//!
//! [logs]
//! default_tail = 100
//! default_buffer = 100
//! channel_capacity = 256
//! timestamps = true
//! follow_reconnect_delay_ms = 2000
//! max_follow_reconnects = 5
//!
//! [supervisor]
//! sweep_interval_secs = 10
//! probe_timeout_ms = 5000
//! start_timeout_secs = 60
//! retention_secs = 300
//!
//! [kube]
//! kubeconfig = "/etc/podrelay/kubeconfig"   # optional
//! context = "staging"                       # optional
//!
//! [logging]
//! level = "info"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "podrelay.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub portforward: PortForwardConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent in-flight HTTP requests (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum non-terminal sessions of both kinds (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Port-forward tunnel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortForwardConfig {
    /// Host address local listeners bind to (default `127.0.0.1`).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Concurrent relay pairs per tunnel; excess connections are closed
    /// on accept (default 32).
    #[serde(default = "default_max_connections_per_session")]
    pub max_connections_per_session: usize,
    /// Upper bound for opening the pod-side stream, in ms (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Log stream settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsConfig {
    /// `tail` used when the WebSocket query omits it (default 100).
    #[serde(default = "default_tail")]
    pub default_tail: u32,
    /// `buffer` used when the WebSocket query omits it (default 100).
    #[serde(default = "default_buffer")]
    pub default_buffer: usize,
    /// Capacity of the manager -> consumer channel (default 256). A full
    /// channel blocks the reader instead of dropping lines.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Ask the kubelet to prefix lines with RFC 3339 timestamps (default true).
    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
    /// Pause before reopening a followed log that ended (default 2000 ms).
    #[serde(default = "default_follow_reconnect_delay_ms")]
    pub follow_reconnect_delay_ms: u64,
    /// Consecutive reopen attempts before the stream errors out (default 5).
    #[serde(default = "default_max_follow_reconnects")]
    pub max_follow_reconnects: u32,
}

/// Background sweep settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Seconds between sweeps (default 10).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Timeout for one pod probe, in ms (default 5000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Sessions stuck in `starting` longer than this are failed (default 60).
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Terminal sessions are purged this long after finishing (default 300).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

/// Kubernetes client settings. Both fields are optional; without them the
/// client uses in-cluster config, `KUBECONFIG`, or `~/.kube/config`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KubeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_max_sessions() -> usize {
    64
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_max_connections_per_session() -> usize {
    32
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_tail() -> u32 {
    100
}
fn default_buffer() -> usize {
    100
}
fn default_channel_capacity() -> usize {
    256
}
fn default_timestamps() -> bool {
    true
}
fn default_follow_reconnect_delay_ms() -> u64 {
    2000
}
fn default_max_follow_reconnects() -> u32 {
    5
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_start_timeout_secs() -> u64 {
    60
}
fn default_retention_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections_per_session: default_max_connections_per_session(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            default_tail: default_tail(),
            default_buffer: default_buffer(),
            channel_capacity: default_channel_capacity(),
            timestamps: default_timestamps(),
            follow_reconnect_delay_ms: default_follow_reconnect_delay_ms(),
            max_follow_reconnects: default_max_follow_reconnects(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            start_timeout_secs: default_start_timeout_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `podrelay.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(DEFAULT_CONFIG_FILE),
            None => None,
        };
        let mut config = match file {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_string(),
                    source,
                })?;
                Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                    path: p.to_string(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply env var overrides, reading variables through `get`.
    pub fn apply_env_from<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = get("PODRELAY_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(port) = get("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT must be a port number, got {port:?}")))?;
            let host = self
                .server
                .listen
                .rsplit_once(':')
                .map_or("0.0.0.0", |(host, _)| host);
            self.server.listen = format!("{host}:{port}");
        }
        if let Some(level) = get("PODRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.listen.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("server.listen {:?}: {e}", self.server.listen))
        })?;
        self.portforward.bind_address.parse::<IpAddr>().map_err(|e| {
            ConfigError::Invalid(format!(
                "portforward.bind_address {:?}: {e}",
                self.portforward.bind_address
            ))
        })?;
        let positive = [
            ("server.max_connections", self.server.max_connections),
            ("server.max_sessions", self.server.max_sessions),
            (
                "portforward.max_connections_per_session",
                self.portforward.max_connections_per_session,
            ),
            ("logs.default_buffer", self.logs.default_buffer),
            ("logs.channel_capacity", self.logs.channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.supervisor.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.portforward.bind_address, "127.0.0.1");
        assert_eq!(config.logs.default_tail, 100);
        assert_eq!(config.logs.default_buffer, 100);
        assert_eq!(config.logging.level, "info");
        assert!(config.kube.kubeconfig.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            max_sessions = 5

            [logs]
            max_follow_reconnects = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_sessions, 5);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.logs.max_follow_reconnects, 0);
        assert_eq!(config.logs.follow_reconnect_delay_ms, 2000);
        assert_eq!(config.supervisor.retention_secs, 300);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[
                ("PODRELAY_LISTEN", "127.0.0.1:9000"),
                ("PODRELAY_LOG_LEVEL", "debug"),
            ]))
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_env_replaces_only_port() {
        let mut config = Config::default();
        config.apply_env_from(env(&[("PORT", "3000")])).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3000");

        let mut config = Config::default();
        assert!(matches!(
            config.apply_env_from(env(&[("PORT", "http")])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.listen = "not-an-address".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.portforward.bind_address = "localhost:1".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_back_to_toml() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(rendered.contains("[portforward]"));
        let parsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(parsed.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(matches!(
            Config::load(Some("/nonexistent/podrelay.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
