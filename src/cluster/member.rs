//! Cluster membership model
//!
//! Members are derived, not stored: every query rebuilds the view from the
//! coordination service's registry, filtered to entries tagged with this
//! cluster's lock key. Each node publishes five tags in fixed order and the
//! heartbeat tag decides liveness.

use std::fmt;

use super::coordination::RegisteredService;

const TAG_IS_LEADER: usize = 0;
const TAG_NODE_KEY: usize = 1;
const TAG_HEARTBEAT: usize = 2;
const TAG_HOSTNAME: usize = 3;
const TAG_LOCK_KEY: usize = 4;
pub(super) const TAG_COUNT: usize = 5;

/// Member liveness, derived from heartbeat age. `Offline` is a suspicion,
/// not a verdict; the health loop still probes before evicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Online => write!(f, "online"),
            Liveness::Offline => write!(f, "offline"),
        }
    }
}

/// One cluster member as seen in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub node_key: String,
    pub hostname: String,
    pub service_ip: String,
    pub port: u16,
    pub is_leader: bool,
    /// Unix seconds of the member's last self-registration.
    pub last_heartbeat: i64,
    pub status: Liveness,
}

impl ClusterMember {
    /// Derive a member from a registry entry. `None` for entries that are
    /// not part of this cluster: fewer than five tags, or a foreign lock
    /// key.
    pub(super) fn from_service(
        service: &RegisteredService,
        lock_key: &str,
        now: i64,
        heartbeat_timeout: i64,
    ) -> Option<Self> {
        if service.tags.len() < TAG_COUNT || service.tags[TAG_LOCK_KEY] != lock_key {
            return None;
        }
        let last_heartbeat: i64 = service.tags[TAG_HEARTBEAT].parse().unwrap_or(0);
        let status = if now - last_heartbeat > heartbeat_timeout {
            Liveness::Offline
        } else {
            Liveness::Online
        };
        Some(Self {
            node_key: service.tags[TAG_NODE_KEY].clone(),
            hostname: service.tags[TAG_HOSTNAME].clone(),
            service_ip: service.address.clone(),
            port: service.port,
            is_leader: service.tags[TAG_IS_LEADER] == "1",
            last_heartbeat,
            status,
        })
    }

    /// The address peers dial to reach this member's broker.
    pub fn address(&self) -> String {
        format!("{}:{}", self.service_ip, self.port)
    }
}

/// Build the five registration tags in wire order.
pub(super) fn make_tags(
    is_leader: bool,
    node_key: &str,
    heartbeat: i64,
    hostname: &str,
    lock_key: &str,
) -> Vec<String> {
    vec![
        if is_leader { "1" } else { "0" }.to_string(),
        node_key.to_string(),
        heartbeat.to_string(),
        hostname.to_string(),
        lock_key.to_string(),
    ]
}
