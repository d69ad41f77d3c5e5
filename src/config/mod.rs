//! Configuration Module
//!
//! Provides TOML-based configuration for rowcast with support for:
//! - Broker settings (bind address, consumer groups)
//! - Node storage paths
//! - Cluster coordination parameters
//! - Follower agent behavior
//! - Environment variable overrides (ROWCAST_* prefix)

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export broker config types
pub use broker::{BrokerConfig, GroupConfig, GroupMode};

// Re-export cluster config types
pub use cluster::ClusterConfig;

mod broker;
mod cluster;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node storage configuration
    pub node: NodeConfig,
    /// Broker configuration
    pub broker: BrokerConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Follower agent configuration
    pub agent: AgentConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Node storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the replication checkpoint and the persistent
    /// node key
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./rowcast-data"),
        }
    }
}

impl NodeConfig {
    /// Path of the replication checkpoint file
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("position.chk")
    }

    /// Path of the persistent node key file
    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }
}

/// Follower agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Whether followers mirror the leader's event stream
    pub enable: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `ROWCAST__` prefix with double underscores for nesting:
    ///    - `ROWCAST__BROKER__PORT=9999` overrides `broker.port`
    ///    - `ROWCAST__CLUSTER__CONSUL_ADDR=http://consul:8500` overrides `cluster.consul_addr`
    ///    - `ROWCAST__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("node.data_dir", "./rowcast-data")?
            .set_default("broker.enable", true)?
            .set_default("broker.listen", "0.0.0.0")?
            .set_default("broker.port", 9998)?
            .set_default("broker.send_queue_capacity", 1_000_000)?
            .set_default("cluster.enable", false)?
            .set_default("cluster.consul_addr", "http://127.0.0.1:8500")?
            .set_default("cluster.lock_key", "rowcast/leader")?
            .set_default("cluster.keepalive_interval", "3s")?
            .set_default("cluster.check_interval", "10s")?
            .set_default("cluster.heartbeat_timeout", "30s")?
            .set_default("agent.enable", true)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (ROWCAST__BROKER__PORT, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("ROWCAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.enable {
            if self.broker.listen.is_empty() {
                return Err(ConfigError::Validation(
                    "broker.listen must not be empty".to_string(),
                ));
            }
            if self.broker.port == 0 {
                return Err(ConfigError::Validation(
                    "broker.port must not be 0".to_string(),
                ));
            }
            if self.broker.send_queue_capacity == 0 {
                return Err(ConfigError::Validation(
                    "broker.send_queue_capacity must not be 0".to_string(),
                ));
            }
            self.broker.listen_addr()?;
        }

        let mut seen = HashSet::new();
        for group in &self.broker.groups {
            if group.name.is_empty() {
                return Err(ConfigError::Validation(
                    "group name must not be empty".to_string(),
                ));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate group name: {}",
                    group.name
                )));
            }
            for filter in &group.filter {
                if let Err(e) = Regex::new(filter) {
                    return Err(ConfigError::Validation(format!(
                        "invalid filter {:?} in group {}: {}",
                        filter, group.name, e
                    )));
                }
            }
        }

        if self.cluster.enable {
            if self.cluster.consul_addr.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.consul_addr must not be empty".to_string(),
                ));
            }
            if self.cluster.lock_key.is_empty() {
                return Err(ConfigError::Validation(
                    "cluster.lock_key must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
