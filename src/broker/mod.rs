//! Broadcast broker
//!
//! Accepts subscriber connections over TCP, assigns them to configured
//! groups through the `SET_GROUP` handshake, and pushes rendered events to
//! the right subscribers under each group's distribution policy. Forwarding
//! agents join through the `AGENT` handshake as mirrors and receive every
//! event unfiltered, plus replication position broadcasts.
//!
//! The broker is itself an event sink: the dispatcher treats TCP fan-out
//! exactly like any other delivery target.

mod connection;
mod group;


pub use connection::ConnectionError;
pub use group::{Group, Subscriber};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::codec::{pack, Command};
use crate::config::{BrokerConfig, ConfigError, GroupMode};
use crate::sink::EventSink;

use connection::Connection;

/// Source of the formatted membership table served to `SHOW_MEMBERS`.
#[async_trait]
pub trait MembersProvider: Send + Sync {
    async fn format_members(&self) -> String;
}

/// Broker-wide delivery counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    receive_count: AtomicU64,
    send_count: AtomicU64,
    send_failure_count: AtomicU64,
}

impl BrokerStats {
    pub(crate) fn record_receive(&self) {
        self.receive_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send(&self) {
        self.send_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            receive_count: self.receive_count.load(Ordering::Relaxed),
            send_count: self.send_count.load(Ordering::Relaxed),
            send_failure_count: self.send_failure_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub receive_count: u64,
    pub send_count: u64,
    pub send_failure_count: u64,
}

/// The broadcast broker.
pub struct Broker {
    bind_addr: SocketAddr,
    send_queue_capacity: usize,
    enabled: AtomicBool,
    groups: Mutex<AHashMap<CompactString, Group>>,
    mirrors: Mutex<Vec<Arc<Subscriber>>>,
    stats: Arc<BrokerStats>,
    next_id: AtomicU64,
    members_provider: RwLock<Option<Arc<dyn MembersProvider>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Build the broker from configuration, compiling every group filter.
    pub fn new(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let bind_addr = config.listen_addr()?;
        let mut groups = AHashMap::with_capacity(config.groups.len());
        for group_config in &config.groups {
            let mut filters = Vec::with_capacity(group_config.filter.len());
            for pattern in &group_config.filter {
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::Validation(format!(
                        "invalid filter {:?} in group {}: {}",
                        pattern, group_config.name, e
                    ))
                })?;
                filters.push(regex);
            }
            groups.insert(
                CompactString::from(group_config.name.as_str()),
                Group::new(group_config.name.as_str(), group_config.mode, filters),
            );
        }
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            bind_addr,
            send_queue_capacity: config.send_queue_capacity,
            enabled: AtomicBool::new(config.enable),
            groups: Mutex::new(groups),
            mirrors: Mutex::new(Vec::new()),
            stats: Arc::new(BrokerStats::default()),
            next_id: AtomicU64::new(1),
            members_provider: RwLock::new(None),
            shutdown,
        })
    }

    /// Run the accept loop until shutdown. Bind failure is fatal to the
    /// caller.
    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!("broker listening on {}", self.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            info!("broker accept loop stopping");
                            return Ok(());
                        }
                    }
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("new connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Spawn the sender and reader tasks for a fresh connection. The sender
    /// starts before the handshake so even the first reply flows through the
    /// send queue.
    fn handle_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            debug!("TCP keepalive setup failed for {}: {}", addr, e);
        }

        let (reader, writer) = stream.into_split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let subscriber = Arc::new(Subscriber::new(id, addr, tx));

        tokio::spawn(connection::sender_loop(
            writer,
            rx,
            subscriber.clone(),
            self.stats.clone(),
            self.shutdown.subscribe(),
        ));
        let conn = Connection::new(reader, addr, subscriber, self.clone());
        tokio::spawn(conn.run(self.shutdown.subscribe()));
    }

    /// Add a handshaken subscriber to `name`. False if the group is not
    /// configured.
    pub(crate) fn join_group(&self, name: &str, weight: u32, subscriber: Arc<Subscriber>) -> bool {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(name) else {
            return false;
        };
        subscriber.set_raw_weight(weight);
        group.add_member(subscriber);
        true
    }

    pub(crate) fn remove_from_group(&self, name: &str, id: u64) {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(name) {
            group.remove_member(id);
        }
    }

    pub(crate) fn register_mirror(&self, subscriber: Arc<Subscriber>) {
        self.mirrors.lock().push(subscriber);
    }

    pub(crate) fn remove_mirror(&self, id: u64) {
        self.mirrors.lock().retain(|m| m.id != id);
    }

    /// Wire in the coordinator once it exists; until then `SHOW_MEMBERS`
    /// answers with an empty payload.
    pub fn set_members_provider(&self, provider: Arc<dyn MembersProvider>) {
        *self.members_provider.write() = Some(provider);
    }

    pub(crate) async fn members_table(&self) -> String {
        let provider = self.members_provider.read().clone();
        match provider {
            Some(provider) => provider.format_members().await,
            None => String::new(),
        }
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Connected consumers able to take an event right now: assigned group
    /// members plus registered mirrors.
    pub fn subscriber_count(&self) -> usize {
        let groups = self.groups.lock();
        let assigned: usize = groups.values().map(|g| g.connected_members().count()).sum();
        let mirrors = self.mirrors.lock().iter().filter(|m| m.is_connected()).count();
        assigned + mirrors
    }

    /// Push one packed `EVENT` frame through every matching group plus all
    /// mirrors.
    fn distribute(&self, table: &str, payload: &[u8]) {
        let frame = pack(Command::Event, payload);
        {
            let groups = self.groups.lock();
            for group in groups.values() {
                if !group.matches(table) {
                    continue;
                }
                match group.mode {
                    GroupMode::Broadcast => {
                        for member in group.connected_members() {
                            member.try_enqueue(frame.clone());
                        }
                    }
                    GroupMode::Weight => {
                        if let Some(target) = group.pick_target() {
                            target.try_enqueue(frame.clone());
                        }
                    }
                }
            }
        }
        let mirrors = self.mirrors.lock();
        for mirror in mirrors.iter().filter(|m| m.is_connected()) {
            mirror.try_enqueue(frame.clone());
        }
    }

    fn enqueue_to_mirrors(&self, frame: Bytes) -> usize {
        let mirrors = self.mirrors.lock();
        let mut enqueued = 0;
        for mirror in mirrors.iter().filter(|m| m.is_connected()) {
            if mirror.try_enqueue(frame.clone()) {
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        let totals = self.stats.snapshot();
        debug!(
            "broker stopping, {} received, {} sent, {} send failures",
            totals.receive_count, totals.send_count, totals.send_failure_count
        );
        let _ = self.shutdown.send(());
    }
}

#[async_trait]
impl EventSink for Broker {
    fn name(&self) -> &str {
        "broker"
    }

    async fn send_all(&self, table: &str, payload: &[u8]) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        if self.subscriber_count() == 0 {
            return false;
        }
        self.distribute(table, payload);
        true
    }

    async fn send_pos(&self, record: &[u8]) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        self.enqueue_to_mirrors(pack(Command::Pos, record)) > 0
    }

    async fn close(&self) {
        self.shutdown();
    }
}
