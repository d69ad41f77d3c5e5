//! Cluster coordinator
//!
//! Ties the coordination backend into leader election and membership. A
//! named lock decides the leader; per-node service registrations make every
//! node discoverable. Two loops keep the view honest:
//!
//! - heartbeat: renew the session and re-register this node's service
//!   entry with a fresh heartbeat tag
//! - health: probe members whose heartbeat went stale, evict the
//!   unreachable, and force a re-election on dead-leader, zero-leader and
//!   split-brain states

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent::LeaderResolver;
use crate::broker::MembersProvider;
use crate::config::ClusterConfig;

use super::coordination::{Coordination, CoordinationError, ServiceRegistration};
use super::member::{self, ClusterMember, Liveness};

/// Dial ceiling for liveness probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Whether a coordination session currently backs this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    Enabled,
    Disabled,
}

/// Election role. Leadership is only ever granted by the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// The coordinator's own state, one explicit enum per axis.
///
/// Transitions are checked: a transition out of a state the node is not in
/// is rejected, so a doubled call cannot silently flip the node twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    participation: Participation,
    role: Role,
}

impl NodeStatus {
    /// `Disabled` / `Follower` until a session is established.
    pub const fn initial() -> Self {
        Self {
            participation: Participation::Disabled,
            role: Role::Follower,
        }
    }

    pub fn participation(&self) -> Participation {
        self.participation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// `Disabled -> Enabled`. `false` when already enabled.
    pub fn enable(&mut self) -> bool {
        match self.participation {
            Participation::Disabled => {
                self.participation = Participation::Enabled;
                true
            }
            Participation::Enabled => false,
        }
    }

    /// `Enabled -> Disabled`. `false` when already disabled.
    pub fn disable(&mut self) -> bool {
        match self.participation {
            Participation::Enabled => {
                self.participation = Participation::Disabled;
                true
            }
            Participation::Disabled => false,
        }
    }

    /// `Follower -> Leader`. `false` when already leader.
    pub fn promote(&mut self) -> bool {
        match self.role {
            Role::Follower => {
                self.role = Role::Leader;
                true
            }
            Role::Leader => false,
        }
    }

    /// `Leader -> Follower`. `false` when already follower.
    pub fn demote(&mut self) -> bool {
        match self.role {
            Role::Leader => {
                self.role = Role::Follower;
                true
            }
            Role::Follower => false,
        }
    }
}

/// Leader election and membership over a [`Coordination`] backend.
pub struct Coordinator {
    backend: Arc<dyn Coordination>,
    lock_key: String,
    node_key: String,
    hostname: String,
    service_ip: String,
    service_port: u16,
    keepalive_interval: Duration,
    check_interval: Duration,
    heartbeat_timeout: Duration,
    status: Mutex<NodeStatus>,
    session: Mutex<Option<String>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Coordinator {
    /// `default_port` is advertised when the configuration sets none; the
    /// node passes its broker port so mirrors know where to dial.
    pub fn new(
        config: &ClusterConfig,
        node_key: String,
        backend: Arc<dyn Coordination>,
        default_port: u16,
    ) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            backend,
            lock_key: config.lock_key.clone(),
            node_key,
            hostname,
            service_ip: config.advertised_ip(),
            service_port: config.service_port.unwrap_or(default_port),
            keepalive_interval: config.keepalive_interval,
            check_interval: config.check_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            status: Mutex::new(NodeStatus::initial()),
            session: Mutex::new(None),
            shutdown,
        }
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock()
    }

    pub fn role(&self) -> Role {
        self.status.lock().role()
    }

    /// The address peers dial for this node.
    pub fn advertised_addr(&self) -> (String, u16) {
        (self.service_ip.clone(), self.service_port)
    }

    /// Cadence at which followers should retry the lock.
    pub fn election_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Establish the session, clean up leftovers of a previous run, and
    /// spawn the heartbeat and health loops.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.ensure_session().await {
            warn!("coordination session not yet available: {e}");
        }
        self.startup_self_check().await;
        self.register_service().await;

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.heartbeat_loop().await });
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.health_loop().await });
    }

    /// Stop the loops and withdraw from the cluster: deregister, give the
    /// lock back when leading, destroy the session.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.backend.deregister_service(&self.node_key).await {
            debug!("deregistration on close failed: {e}");
        }
        let session = self.session.lock().take();
        if self.role() == Role::Leader {
            if let Some(session) = &session {
                let _ = self.backend.release(&self.lock_key, session).await;
            }
            if let Err(e) = self.backend.delete(&self.lock_key).await {
                debug!("lock delete on close failed: {e}");
            }
            self.status.lock().demote();
        }
        if let Some(session) = &session {
            if let Err(e) = self.backend.destroy_session(session).await {
                debug!("session destroy on close failed: {e}");
            }
        }
        self.status.lock().disable();
        info!("left the cluster");
    }

    /// The current session id, creating one if none exists. The first
    /// session flips the node to `Enabled`.
    async fn ensure_session(&self) -> Result<String, CoordinationError> {
        let existing = self.session.lock().clone();
        if let Some(session) = existing {
            return Ok(session);
        }
        let session = self.backend.create_session().await?;
        info!("coordination session established: {session}");
        *self.session.lock() = Some(session.clone());
        if self.status.lock().enable() {
            debug!("cluster participation enabled");
        }
        Ok(session)
    }

    /// Drop the cached session and establish a fresh one. Called when the
    /// backend reports the session dead.
    async fn recreate_session(&self) {
        *self.session.lock() = None;
        if let Err(e) = self.ensure_session().await {
            error!("session recreation failed: {e}");
        }
    }

    /// Try to take the leader lock. `Ok(true)` means this node leads now.
    ///
    /// A session-scoped failure recreates the session for the next attempt;
    /// no other failure is retried here.
    pub async fn acquire_lock(&self) -> Result<bool, CoordinationError> {
        let session = self.ensure_session().await?;
        match self.backend.acquire(&self.lock_key, &session).await {
            Ok(true) => {
                if self.status.lock().promote() {
                    info!("elected leader for {}", self.lock_key);
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                error!("lock acquisition failed: {e}");
                if e.is_session_error() {
                    warn!("session implicated, recreating it");
                    self.recreate_session().await;
                }
                Err(e)
            }
        }
    }

    /// Give the leader lock back and step down.
    pub async fn release_lock(&self) -> Result<bool, CoordinationError> {
        let session = self.ensure_session().await?;
        match self.backend.release(&self.lock_key, &session).await {
            Ok(released) => {
                if self.status.lock().demote() {
                    info!("released leadership of {}", self.lock_key);
                }
                Ok(released)
            }
            Err(e) => {
                error!("lock release failed: {e}");
                if e.is_session_error() {
                    self.recreate_session().await;
                }
                Err(e)
            }
        }
    }

    /// Remove `key` outright, whoever holds it. Deleting this cluster's own
    /// lock key also steps a local leader down, since the lock no longer
    /// backs the role.
    pub async fn delete_lock(&self, key: &str) -> Result<(), CoordinationError> {
        self.backend.delete(key).await?;
        if key == self.lock_key && self.status.lock().demote() {
            warn!("leader lock {key} deleted, stepping down");
        }
        Ok(())
    }

    /// Session renewal plus service re-registration, forever. Registration
    /// is what makes this node visible as a member, so it runs on every
    /// tick whether or not this node leads.
    async fn heartbeat_loop(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            debug!("heartbeat loop stopping");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.renew_session().await;
                    self.register_service().await;
                }
            }
        }
    }

    async fn renew_session(&self) {
        let session = self.session.lock().clone();
        let Some(session) = session else {
            if let Err(e) = self.ensure_session().await {
                debug!("session still unavailable: {e}");
            }
            return;
        };
        if let Err(e) = self.backend.renew_session(&session).await {
            warn!("session renewal failed: {e}");
            if e.is_session_error() {
                self.recreate_session().await;
            }
        }
    }

    /// Push this node's service entry with a fresh heartbeat tag.
    async fn register_service(&self) {
        let registration = self.registration();
        if let Err(e) = self.backend.register_service(&registration).await {
            error!("service registration failed: {e}");
        }
    }

    fn registration(&self) -> ServiceRegistration {
        let is_leader = self.role() == Role::Leader;
        ServiceRegistration {
            id: self.node_key.clone(),
            name: self.lock_key.clone(),
            tags: member::make_tags(
                is_leader,
                &self.node_key,
                unix_now(),
                &self.hostname,
                &self.lock_key,
            ),
            address: self.service_ip.clone(),
            port: self.service_port,
        }
    }

    /// Membership policing, forever. The first sweep waits one full
    /// interval so a freshly joined node judges members it has actually
    /// seen heartbeat.
    async fn health_loop(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            debug!("health loop stopping");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.health_sweep().await;
                }
            }
        }
    }

    /// One pass: count live leaders, probe suspects, evict the dead, and
    /// correct zero-leader and split-brain states with a forced lock
    /// delete. At most one forced delete per pass per condition, so a
    /// herd of stale entries cannot stampede the lock.
    pub(super) async fn health_sweep(&self) {
        let members = self.membership().await;
        if members.is_empty() {
            return;
        }

        let mut live_leaders = 0;
        for member in &members {
            if member.is_leader
                && (member.status == Liveness::Online || self.probe(&member.address()).await)
            {
                live_leaders += 1;
            }
            if member.node_key == self.node_key || member.status == Liveness::Online {
                continue;
            }
            warn!(
                "member {} missed heartbeats (last {}s ago)",
                member.node_key,
                unix_now().saturating_sub(member.last_heartbeat)
            );
            if self.probe(&member.address()).await {
                continue;
            }
            info!("evicting unreachable member {}", member.node_key);
            if let Err(e) = self.backend.deregister_service(&member.node_key).await {
                error!("eviction of {} failed: {e}", member.node_key);
            }
            if member.is_leader {
                warn!("evicted member led the cluster, forcing a re-election");
                let _ = self.delete_lock(&self.lock_key).await;
            }
        }

        if live_leaders == 0 {
            warn!("no live leader among {} member(s)", members.len());
            if self.role() == Role::Follower {
                // Clear any stale lock so the next acquisition can win.
                let _ = self.delete_lock(&self.lock_key).await;
            }
        } else if live_leaders > 1 {
            warn!("split brain: {live_leaders} live leaders, forcing a re-election");
            let _ = self.delete_lock(&self.lock_key).await;
        }
    }

    /// A previous run may have died while leading, leaving a registry entry
    /// that still claims the lock. Release and delete it so this cluster
    /// can elect immediately instead of waiting out the session TTL.
    pub(super) async fn startup_self_check(&self) {
        let member = self
            .membership()
            .await
            .into_iter()
            .find(|m| m.node_key == self.node_key);
        let Some(member) = member else { return };
        if member.is_leader && member.status == Liveness::Offline {
            warn!("stale leadership from a previous run, giving the lock back");
            let _ = self.release_lock().await;
            let _ = self.delete_lock(&self.lock_key).await;
        }
    }

    /// The current membership view. Registry entries without this cluster's
    /// lock key are ignored.
    pub async fn membership(&self) -> Vec<ClusterMember> {
        let services = match self.backend.list_services().await {
            Ok(services) => services,
            Err(e) => {
                error!("service listing failed: {e}");
                return Vec::new();
            }
        };
        let now = unix_now();
        let timeout = self.heartbeat_timeout.as_secs() as i64;
        services
            .iter()
            .filter_map(|s| ClusterMember::from_service(s, &self.lock_key, now, timeout))
            .collect()
    }

    /// The leader's advertised address. Prefers a member both flagged and
    /// heartbeat-fresh, then falls back to probing every flagged member
    /// before giving up.
    pub async fn get_leader(&self) -> Option<(String, u16)> {
        let members = self.membership().await;
        for member in &members {
            if member.is_leader && member.status == Liveness::Online {
                return Some((member.service_ip.clone(), member.port));
            }
        }
        for member in &members {
            if member.is_leader && self.probe(&member.address()).await {
                return Some((member.service_ip.clone(), member.port));
            }
        }
        None
    }

    /// Active liveness check. Only a failed dial condemns a member; a
    /// heartbeat can go stale on a merely slow node.
    async fn probe(&self, addr: &str) -> bool {
        debug!("probing {addr}");
        matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Operator-facing membership table served over the control channel.
    pub async fn render_members(&self) -> String {
        let members = self.membership().await;
        if members.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        let _ = write!(
            out,
            "current node: {}({}:{})\r\n",
            self.hostname, self.service_ip, self.service_port
        );
        let _ = write!(out, "cluster size: {} node(s)\r\n", members.len());
        let _ = write!(
            out,
            "======+=============================================+==========+===============\r\n"
        );
        let _ = write!(out, "{:<6}| {:<43} | {:<8} | {}\r\n", "index", "node", "role", "status");
        let _ = write!(
            out,
            "------+---------------------------------------------+----------+---------------\r\n"
        );
        for (index, member) in members.iter().enumerate() {
            let node = format!("{}({})", member.hostname, member.address());
            let role = if member.is_leader { Role::Leader } else { Role::Follower };
            let _ = write!(
                out,
                "{:<6}| {:<43} | {:<8} | {}\r\n",
                index, node, role, member.status
            );
        }
        let _ = write!(
            out,
            "------+---------------------------------------------+----------+---------------\r\n"
        );
        out
    }
}

#[async_trait]
impl MembersProvider for Coordinator {
    async fn format_members(&self) -> String {
        self.render_members().await
    }
}

#[async_trait]
impl LeaderResolver for Coordinator {
    async fn leader_addr(&self) -> Option<(String, u16)> {
        self.get_leader().await
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
