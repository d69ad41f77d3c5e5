//! Node orchestration
//!
//! One [`Node`] owns every subsystem and wires the leader gate: exactly one
//! cluster member runs the replication source, everyone else mirrors the
//! leader through the forwarding agent. Role changes are observed on the
//! election interval, so a deposed leader drops its source task and rejoins
//! as a mirror without restarting the process.
//!
//! Without cluster coordination the node runs standalone: it replicates
//! unconditionally and never starts the agent.


use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{ForwardingAgent, LeaderResolver};
use crate::broker::Broker;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::cluster::{ConsulCoordination, CoordinationError, Coordinator, Role};
use crate::config::{Config, ConfigError};
use crate::sink::SinkSet;
use crate::source::{EventDispatcher, ReplicationSource};

/// Errors that stop a node from being built or run.
#[derive(Debug)]
pub enum NodeError {
    Config(ConfigError),
    Checkpoint(CheckpointError),
    Coordination(CoordinationError),
    Io(std::io::Error),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Config(e) => write!(f, "configuration: {e}"),
            NodeError::Checkpoint(e) => write!(f, "checkpoint: {e}"),
            NodeError::Coordination(e) => write!(f, "coordination: {e}"),
            NodeError::Io(e) => write!(f, "i/o: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Config(e) => Some(e),
            NodeError::Checkpoint(e) => Some(e),
            NodeError::Coordination(e) => Some(e),
            NodeError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

impl From<CheckpointError> for NodeError {
    fn from(e: CheckpointError) -> Self {
        NodeError::Checkpoint(e)
    }
}

impl From<CoordinationError> for NodeError {
    fn from(e: CoordinationError) -> Self {
        NodeError::Coordination(e)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e)
    }
}

/// A complete engine instance: broker, coordinator, agent, dispatcher and
/// checkpoint, assembled from one [`Config`].
pub struct Node {
    config: Config,
    checkpoint: Arc<CheckpointStore>,
    sinks: Arc<SinkSet>,
    broker: Option<Arc<Broker>>,
    coordinator: Option<Arc<Coordinator>>,
    dispatcher: Arc<EventDispatcher>,
    agent: Option<Arc<ForwardingAgent>>,
    source: Option<Arc<dyn ReplicationSource>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Build every subsystem. Fails on anything the process cannot run
    /// without: the data directory, the checkpoint file, or the
    /// coordination client.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.node.data_dir)?;
        let checkpoint = Arc::new(CheckpointStore::open(config.node.checkpoint_path())?);
        let sinks = Arc::new(SinkSet::new());

        let broker = if config.broker.enable {
            let broker = Arc::new(Broker::new(&config.broker)?);
            sinks.register(broker.clone());
            Some(broker)
        } else {
            None
        };

        let coordinator = if config.cluster.enable {
            let node_key = load_node_key(&config.node.node_key_path())?;
            info!("node key: {node_key}");
            let backend = Arc::new(ConsulCoordination::new(&config.cluster.consul_addr)?);
            let coordinator = Arc::new(Coordinator::new(
                &config.cluster,
                node_key,
                backend,
                config.broker.port,
            ));
            if let Some(broker) = &broker {
                broker.set_members_provider(coordinator.clone());
            }
            Some(coordinator)
        } else {
            None
        };

        let start = checkpoint.load();
        let dispatcher = Arc::new(EventDispatcher::new(
            sinks.clone(),
            checkpoint.clone(),
            start.event_index,
        ));

        let agent = match (&coordinator, config.agent.enable) {
            (Some(coordinator), true) => {
                let resolver: Arc<dyn LeaderResolver> = coordinator.clone();
                Some(Arc::new(ForwardingAgent::new(
                    sinks.clone(),
                    checkpoint.clone(),
                    resolver,
                    Some(coordinator.advertised_addr()),
                )))
            }
            _ => None,
        };

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            checkpoint,
            sinks,
            broker,
            coordinator,
            dispatcher,
            agent,
            source: None,
            shutdown,
        })
    }

    /// Wire the external replication source adapter. Without one the node
    /// still serves subscribers and mirrors, but a leader has nothing to
    /// stream.
    pub fn set_source(&mut self, source: Arc<dyn ReplicationSource>) {
        self.source = Some(source);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sinks(&self) -> &Arc<SinkSet> {
        &self.sinks
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn broker(&self) -> Option<&Arc<Broker>> {
        self.broker.as_ref()
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Ask a running node to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Run until interrupted or [`Node::shutdown`] is called.
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        info!("node starting");
        self.sinks.start_all().await;

        if let Some(broker) = &self.broker {
            let broker = broker.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.run().await {
                    error!("broker terminated: {e}");
                    let _ = shutdown.send(());
                }
            });
        }

        if let Some(coordinator) = &self.coordinator {
            coordinator.start().await;
        }

        let node = self.clone();
        let election = tokio::spawn(async move { node.election_loop().await });

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                let _ = self.shutdown.send(());
            }
            _ = shutdown_rx.recv() => {}
        }

        let _ = election.await;
        self.stop().await;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(agent) = &self.agent {
            agent.close();
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.close().await;
        }
        self.sinks.close_all().await;
        info!("node stopped");
    }

    /// The leader gate. Followers keep trying for the lock and mirror the
    /// leader meanwhile; the winner stops mirroring and streams from the
    /// checkpoint; a deposed leader drops its source task and falls back.
    async fn election_loop(self: Arc<Self>) {
        let Some(coordinator) = self.coordinator.clone() else {
            self.run_standalone().await;
            return;
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(coordinator.election_interval());
        let mut source_task: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => break,
                    }
                }
                _ = ticker.tick() => {}
            }

            match coordinator.role() {
                Role::Leader => {
                    if let Some(agent) = &self.agent {
                        agent.close();
                    }
                    if self.source.is_some()
                        && source_task.as_ref().map_or(true, |t| t.is_finished())
                    {
                        source_task = self.spawn_source();
                    }
                }
                Role::Follower => {
                    if let Some(task) = source_task.take() {
                        warn!("leadership lost, stopping the replication source");
                        task.abort();
                    }
                    match coordinator.acquire_lock().await {
                        Ok(true) => {
                            info!("taking over replication on the next tick");
                        }
                        Ok(false) => {
                            debug!("lock held elsewhere, mirroring");
                            if let Some(agent) = &self.agent {
                                agent.start();
                            }
                        }
                        Err(e) => {
                            warn!("lock attempt failed: {e}");
                            if let Some(agent) = &self.agent {
                                agent.start();
                            }
                        }
                    }
                }
            }
        }
        if let Some(task) = source_task.take() {
            task.abort();
        }
    }

    /// No coordinator: replicate unconditionally until shutdown.
    async fn run_standalone(&self) {
        let Some(task) = self.spawn_source() else {
            info!("no replication source wired, serving subscribers only");
            return;
        };
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            match shutdown_rx.recv().await {
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                _ => break,
            }
        }
        task.abort();
    }

    fn spawn_source(&self) -> Option<JoinHandle<()>> {
        let source = self.source.clone()?;
        let dispatcher = self.dispatcher.clone();
        let from = self.checkpoint.load();
        info!("starting the replication source from {from}");
        Some(tokio::spawn(async move {
            if let Err(e) = source.run(from, dispatcher).await {
                error!("replication source ended: {e}");
            }
        }))
    }
}

/// Load the persistent node key, generating one on first run. The key is
/// this node's stable identity in the coordination registry; losing it
/// makes the node a stranger to its own cluster.
fn load_node_key(path: &Path) -> Result<String, NodeError> {
    match std::fs::read_to_string(path) {
        Ok(key) if !key.trim().is_empty() => return Ok(key.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(NodeError::Io(e)),
    }
    let key = generate_node_key();
    std::fs::write(path, &key)?;
    info!("generated node key {key}");
    Ok(key)
}

/// Generate a random 128-bit node identity
fn generate_node_key() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{:016x}{:016x}", hasher.finish(), nanos)
}
