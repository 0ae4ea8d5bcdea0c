//! Monitor configuration.
//!
//! Configuration is read from a TOML file; every key is optional:
//!
//! ```toml
//! [gateway]
//! host = "sitemgr.testbed.local"
//! up_port = 5000
//! down_port = 5051
//! connect_timeout_ms = 5000
//!
//! [nodes]
//! online_timeout_ms = 4000
//! poll_interval_ms = 1000
//! log_capacity = 100
//!
//! [hosts]
//! "10.0.0.7" = "node07.testbed.local"
//! ```
//!
//! The file is located via `TBM_CONFIG`, falling back to
//! `<config dir>/tbm/config.toml`. `TBM_GATEWAY` overrides the gateway host.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use tbm_core::DEFAULT_LOG_CAPACITY;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TBM_CONFIG";

/// Environment variable overriding the gateway host.
pub const GATEWAY_ENV: &str = "TBM_GATEWAY";

/// Default port accepting commands.
pub const DEFAULT_UP_PORT: u16 = 5000;

/// Default port streaming node events.
pub const DEFAULT_DOWN_PORT: u16 = 5051;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Site manager connection settings
    pub gateway: GatewayConfig,

    /// Node tracking settings
    pub nodes: NodeSettings,

    /// Static IP to host name table used when a node is first seen
    pub hosts: HashMap<String, String>,
}

/// Where and how to reach the site manager.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub up_port: u16,
    pub down_port: u16,
    pub connect_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Address of the event stream.
    pub fn down_addr(&self) -> String {
        format!("{}:{}", self.host, self.down_port)
    }

    /// Address accepting commands.
    pub fn up_addr(&self) -> String {
        format!("{}:{}", self.host, self.up_port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            up_port: DEFAULT_UP_PORT,
            down_port: DEFAULT_DOWN_PORT,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Liveness and buffering parameters shared by all nodes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeSettings {
    /// A node is online if it pinged within this window
    pub online_timeout_ms: u64,

    /// Poll period of `block_until_online`
    pub poll_interval_ms: u64,

    /// Log records kept per node
    pub log_capacity: usize,
}

impl NodeSettings {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_millis(self.online_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            online_timeout_ms: 4_000,
            poll_interval_ms: 1_000,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl MonitorConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Loads configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text, path)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Loads the configuration file named by `TBM_CONFIG` or found in the
    /// user config directory, or the defaults if neither exists.
    ///
    /// A file named by `TBM_CONFIG` must exist; the config directory
    /// fallback is optional.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Applies `TBM_GATEWAY` if set.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = env::var(GATEWAY_ENV) {
            if !host.trim().is_empty() {
                self.gateway.host = host.trim().to_string();
            }
        }
        self
    }
}

/// Returns `<config dir>/tbm/config.toml`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tbm").join("config.toml"))
}
