//! Broker Configuration
//!
//! Configuration types for the broadcast broker and its subscriber groups.

use std::net::SocketAddr;

use serde::Deserialize;

use super::ConfigError;

/// Distribution mode of a subscriber group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Every connected member receives every matching event
    #[default]
    Broadcast,
    /// One member per event, picked by weighted fairness
    Weight,
}

impl std::fmt::Display for GroupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupMode::Broadcast => write!(f, "broadcast"),
            GroupMode::Weight => write!(f, "weight"),
        }
    }
}

/// One configured subscriber group
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Group name clients name in their handshake
    pub name: String,

    /// Distribution mode
    #[serde(default)]
    pub mode: GroupMode,

    /// Table filters as regular expressions over the `schema.table` key.
    /// Empty means the group receives every event.
    #[serde(default)]
    pub filter: Vec<String>,
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Whether the broker listens at all
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// Listen IP
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-connection send queue capacity
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Subscriber groups
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_enable() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9998
}

fn default_send_queue_capacity() -> usize {
    1_000_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            listen: default_listen(),
            port: default_port(),
            send_queue_capacity: default_send_queue_capacity(),
            groups: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// The socket address the broker binds
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen, self.port)
            .parse()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "invalid broker listen address {}:{}: {}",
                    self.listen, self.port, e
                ))
            })
    }
}
