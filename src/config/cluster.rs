//! Cluster Configuration
//!
//! Configuration types for coordination-service-backed leader election.

use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

/// Cluster configuration for leader-elected replication
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether cluster coordination is enabled
    pub enable: bool,

    /// Base URL of the coordination service HTTP API
    #[serde(default = "default_consul_addr")]
    pub consul_addr: String,

    /// Distributed lock key; doubles as the cluster namespace, so every
    /// node of one cluster must share it
    #[serde(default = "default_lock_key")]
    pub lock_key: String,

    /// IP advertised to peers (resolved from the hostname if not set)
    pub service_ip: Option<String>,

    /// Port advertised to peers (the broker port if not set)
    pub service_port: Option<u16>,

    /// Session renewal and service re-registration period
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// Cluster health sweep period
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Heartbeat age beyond which a member counts as offline
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Duration,
}

fn default_consul_addr() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_lock_key() -> String {
    "rowcast/leader".to_string()
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            consul_addr: default_consul_addr(),
            lock_key: default_lock_key(),
            service_ip: None,
            service_port: None,
            keepalive_interval: default_keepalive_interval(),
            check_interval: default_check_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
        }
    }
}

impl ClusterConfig {
    /// The IP peers should dial for this node.
    /// Priority: explicit config > resolved hostname > loopback.
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.service_ip {
            return ip.clone();
        }
        if let Some(ip) = resolve_local_ip() {
            return ip.to_string();
        }
        "127.0.0.1".to_string()
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let hostname_str = hostname.to_string_lossy();

    let addr_str = format!("{}:0", hostname_str);
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enable);
        assert_eq!(config.consul_addr, "http://127.0.0.1:8500");
        assert_eq!(config.lock_key, "rowcast/leader");
        assert_eq!(config.keepalive_interval, Duration::from_secs(3));
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_advertised_ip_prefers_explicit() {
        let config = ClusterConfig {
            service_ip: Some("10.1.2.3".to_string()),
            ..ClusterConfig::default()
        };
        assert_eq!(config.advertised_ip(), "10.1.2.3");
    }

    #[test]
    fn test_advertised_ip_never_empty() {
        let config = ClusterConfig::default();
        assert!(!config.advertised_ip().is_empty());
    }

    #[test]
    fn test_humantime_durations_parse() {
        let config: ClusterConfig =
            toml::from_str("enable = true\nkeepalive_interval = \"500ms\"\ncheck_interval = \"1m\"")
                .expect("parse");
        assert_eq!(config.keepalive_interval, Duration::from_millis(500));
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }
}
