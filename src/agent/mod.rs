//! Forwarding agent
//!
//! Followers never touch the replication stream, but their local consumers
//! still need data. The agent dials the current leader's broker, registers
//! as a mirror through the `AGENT` handshake, and re-emits everything it
//! receives into the local sink set as if it had been observed locally.
//! Position broadcasts land in the local checkpoint, so a promoted
//! follower resumes close to where the leader stopped.
//!
//! Connection loss is routine here. The agent retries on a fixed backoff
//! and re-resolves the leader on every attempt, which is also how it
//! follows a leadership change.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, Position};
use crate::codec::{self, Command, Frame, FrameAssembler, AGENT_ASSEMBLY_LIMIT};
use crate::event::EventEnvelope;
use crate::sink::SinkSet;

/// Fixed delay between connection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
/// Dial ceiling per attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Keepalive cadence while connected.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEPALIVE_PAYLOAD: &str = "agent keep alive";

/// Where the agent finds the node to mirror.
#[async_trait]
pub trait LeaderResolver: Send + Sync {
    /// The current leader's advertised address, if one is known.
    async fn leader_addr(&self) -> Option<(String, u16)>;
}

/// Agent lifecycle state. `Offline` means not running at all; a running
/// agent is `Disconnected` between leader connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Offline,
    Disconnected,
    Connected,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Disconnected => write!(f, "disconnected"),
            AgentStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Errors from one leader connection.
#[derive(Debug)]
pub enum AgentError {
    Io(std::io::Error),
    /// The leader closed the connection.
    Closed,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Io(e) => write!(f, "i/o failure: {e}"),
            AgentError::Closed => write!(f, "connection closed by the leader"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Io(e) => Some(e),
            AgentError::Closed => None,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e)
    }
}

/// Mirrors the leader's event stream into the local sink set.
pub struct ForwardingAgent {
    sinks: Arc<SinkSet>,
    checkpoint: Arc<CheckpointStore>,
    resolver: Arc<dyn LeaderResolver>,
    /// This node's own advertised address. A leader must never mirror
    /// itself, so a resolution pointing here is skipped.
    own_addr: Option<(String, u16)>,
    status: RwLock<AgentStatus>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl ForwardingAgent {
    pub fn new(
        sinks: Arc<SinkSet>,
        checkpoint: Arc<CheckpointStore>,
        resolver: Arc<dyn LeaderResolver>,
        own_addr: Option<(String, u16)>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sinks,
            checkpoint,
            resolver,
            own_addr,
            status: RwLock::new(AgentStatus::Offline),
            shutdown,
        }
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Start the connect loop. `false` when the agent is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        {
            let mut status = self.status.write();
            if *status != AgentStatus::Offline {
                return false;
            }
            *status = AgentStatus::Disconnected;
        }
        info!("forwarding agent starting");
        let agent = self.clone();
        tokio::spawn(async move { agent.connection_loop().await });
        true
    }

    /// Stop mirroring. The agent stays `Offline` until the next `start`.
    pub fn close(&self) {
        {
            let mut status = self.status.write();
            if *status == AgentStatus::Offline {
                return;
            }
            *status = AgentStatus::Offline;
        }
        info!("forwarding agent stopping");
        let _ = self.shutdown.send(());
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if self.status() == AgentStatus::Offline {
                return;
            }
            let target = match self.resolver.leader_addr().await {
                Some(addr) if Some(&addr) == self.own_addr.as_ref() => {
                    debug!("this node is the leader, nothing to mirror");
                    None
                }
                Some(addr) => Some(addr),
                None => {
                    debug!("no leader to mirror yet");
                    None
                }
            };
            let Some((host, port)) = target else {
                if self.backoff(&mut shutdown_rx).await {
                    return;
                }
                continue;
            };

            let addr = format!("{host}:{port}");
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    info!("mirroring leader at {addr}");
                    *self.status.write() = AgentStatus::Connected;
                    let result = self.serve(stream, &mut shutdown_rx).await;
                    {
                        let mut status = self.status.write();
                        if *status != AgentStatus::Offline {
                            *status = AgentStatus::Disconnected;
                        }
                    }
                    match result {
                        Ok(()) => return,
                        Err(e) => warn!("leader connection to {addr} lost: {e}"),
                    }
                }
                Ok(Err(e)) => warn!("leader dial to {addr} failed: {e}"),
                Err(_) => warn!("leader dial to {addr} timed out"),
            }
            if self.backoff(&mut shutdown_rx).await {
                return;
            }
        }
    }

    /// One backoff period, cut short by shutdown. `true` when shutting
    /// down.
    async fn backoff(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            biased;

            result = shutdown_rx.recv() => {
                !matches!(result, Err(broadcast::error::RecvError::Lagged(_)))
            }
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => false,
        }
    }

    /// Register as a mirror, then relay frames until the connection dies
    /// or shutdown is signalled. `Ok` only on shutdown.
    async fn serve(
        &self,
        mut stream: TcpStream,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), AgentError> {
        stream.write_all(&codec::pack(Command::Agent, b"")).await?;

        let keepalive = codec::pack_str(Command::Tick, KEEPALIVE_PAYLOAD);
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        let mut assembler = FrameAssembler::new(AGENT_ASSEMBLY_LIMIT);
        let mut read_buf = BytesMut::with_capacity(16 * 1024);
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    stream.write_all(&keepalive).await?;
                }
                result = stream.read_buf(&mut read_buf) => {
                    if result? == 0 {
                        return Err(AgentError::Closed);
                    }
                    let frames = assembler.feed(&read_buf);
                    read_buf.clear();
                    for frame in frames {
                        self.handle_frame(frame).await;
                    }
                }
            }
        }
    }

    /// Dispatch one frame from the leader. Events re-enter the local sink
    /// set, positions land in the local checkpoint, replies are noise.
    async fn handle_frame(&self, frame: Frame) {
        match frame.kind() {
            Some(Command::Event) => {
                let envelope: EventEnvelope = match serde_json::from_slice(&frame.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("dropping undecodable event from the leader: {e}");
                        return;
                    }
                };
                let table = envelope.table_key();
                debug!(table = %table, "relaying event");
                self.sinks.notify(&table, &frame.payload).await;
            }
            Some(Command::Pos) => match Position::decode(&frame.payload) {
                Ok(position) => {
                    debug!(position = %position, "checkpoint from the leader");
                    if let Err(e) = self.checkpoint.save(&position) {
                        error!("saving the leader's checkpoint failed: {e}");
                    }
                }
                Err(e) => warn!("dropping undecodable position from the leader: {e}"),
            },
            Some(Command::Tick) => {
                debug!("keepalive answered");
            }
            _ => {
                debug!(command = frame.command, "ignoring frame from the leader");
            }
        }
    }
}
