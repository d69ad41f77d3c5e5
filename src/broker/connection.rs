//! Subscriber connection handling
//!
//! One reader task per accepted connection plus a dedicated sender task
//! draining the connection's send queue. Replies and distributed events alike
//! travel through the queue, so the reader half never writes to the socket
//! and a slow peer can only ever stall its own sender.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::broker::group::Subscriber;
use crate::broker::{Broker, BrokerStats};
use crate::codec::{self, Command, Frame, FrameAssembler, DEFAULT_ASSEMBLY_LIMIT};

/// Window from accept within which a connection must complete its handshake.
pub(crate) const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Write deadline for one frame in the sender loop.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    /// The peer never completed a handshake before the read deadline.
    HandshakeTimeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::HandshakeTimeout => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            ConnectionError::HandshakeTimeout => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Handshake state
enum State {
    /// Waiting for the first `SET_GROUP` or `AGENT` frame.
    AwaitingAssignment,
    /// Member of the named subscriber group.
    Assigned(CompactString),
    /// Registered as a mirror; receives every event unfiltered.
    Mirror,
}

/// Reader side of one subscriber connection.
pub(crate) struct Connection {
    reader: OwnedReadHalf,
    addr: SocketAddr,
    subscriber: Arc<Subscriber>,
    broker: Arc<Broker>,
    state: State,
    /// Fixed handshake deadline; trickled partial frames do not extend it.
    handshake_deadline: Instant,
    assembler: FrameAssembler,
    read_buf: BytesMut,
}

impl Connection {
    pub(crate) fn new(
        reader: OwnedReadHalf,
        addr: SocketAddr,
        subscriber: Arc<Subscriber>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            reader,
            addr,
            subscriber,
            broker,
            state: State::AwaitingAssignment,
            handshake_deadline: Instant::now() + HANDSHAKE_READ_TIMEOUT,
            assembler: FrameAssembler::new(DEFAULT_ASSEMBLY_LIMIT),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Run the reader until EOF, error, or shutdown, then unregister.
    pub(crate) async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let result = self.serve(&mut shutdown).await;
        self.subscriber.disconnect();
        match &self.state {
            State::Assigned(group) => self.broker.remove_from_group(group, self.subscriber.id),
            State::Mirror => self.broker.remove_mirror(self.subscriber.id),
            State::AwaitingAssignment => {}
        }
        let (sent, failed) = (self.subscriber.sent(), self.subscriber.failures());
        match result {
            Ok(()) => debug!("connection {} closed, {sent} sent, {failed} failed", self.addr),
            Err(e) => debug!("connection {} ended after {sent} sends: {}", self.addr, e),
        }
    }

    async fn serve(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            let deadline = match self.state {
                State::AwaitingAssignment => Some(self.handshake_deadline),
                _ => None,
            };
            let n = tokio::select! {
                biased;

                result = shutdown.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => return Ok(()),
                    }
                }
                result = read_some(&mut self.reader, &mut self.read_buf, deadline) => result?,
            };
            if n == 0 {
                return Ok(());
            }
            let frames = self.assembler.feed(&self.read_buf);
            self.read_buf.clear();
            for frame in frames {
                self.handle_frame(frame).await;
            }
        }
    }

    /// Dispatch one complete frame. Protocol violations are answered with an
    /// `ERROR` frame and never close the connection.
    async fn handle_frame(&mut self, frame: Frame) {
        self.broker.stats().record_receive();
        match frame.kind() {
            Some(Command::SetGroup) => self.handle_set_group(&frame),
            Some(Command::Agent) => self.handle_agent(),
            Some(Command::Tick) => {
                self.reply(codec::pack_str(Command::Tick, "ok"));
            }
            Some(Command::ShowMembers) => {
                let table = self.broker.members_table().await;
                self.reply(codec::pack(Command::ShowMembers, table.as_bytes()));
            }
            _ => {
                self.reply(codec::pack_str(
                    Command::Error,
                    &format!("unsupported command: {}", frame.command),
                ));
            }
        }
    }

    fn handle_set_group(&mut self, frame: &Frame) {
        if !matches!(self.state, State::AwaitingAssignment) {
            self.reply(codec::pack_str(Command::Error, "already assigned"));
            return;
        }
        let (weight, group) = match codec::parse_set_group(&frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("bad set-group payload from {}: {}", self.addr, e);
                self.reply(codec::pack_str(Command::Error, "malformed set-group payload"));
                return;
            }
        };
        if weight > 100 {
            self.reply(codec::pack_str(
                Command::Error,
                &format!("unsupported weight: {}, expected 0-100", weight),
            ));
            return;
        }
        if !self.broker.join_group(group, weight, self.subscriber.clone()) {
            self.reply(codec::pack_str(
                Command::Error,
                &format!("unknown group: {}", group),
            ));
            return;
        }
        self.state = State::Assigned(CompactString::from(group));
        debug!("subscriber {} assigned to group {} (weight {})", self.addr, group, weight);
        self.reply(codec::pack_str(Command::SetGroup, "ok"));
    }

    fn handle_agent(&mut self) {
        if !matches!(self.state, State::AwaitingAssignment) {
            self.reply(codec::pack_str(Command::Error, "already assigned"));
            return;
        }
        self.broker.register_mirror(self.subscriber.clone());
        self.state = State::Mirror;
        debug!("mirror registered from {}", self.addr);
        self.reply(codec::pack_str(Command::Agent, "ok"));
    }

    fn reply(&self, frame: Bytes) {
        self.subscriber.try_enqueue(frame);
    }
}

/// One read into `buf`, bounded by the handshake deadline while unassigned.
async fn read_some(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> Result<usize, ConnectionError> {
    match deadline {
        Some(deadline) => match timeout_at(deadline, reader.read_buf(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::HandshakeTimeout),
        },
        None => Ok(reader.read_buf(buf).await?),
    }
}

/// Drain one connection's send queue onto the socket.
///
/// Every queued frame counts as one delivery attempt. A write failure or
/// timeout counts against the subscriber and the broker totals but never
/// closes the connection; only the read side decides that.
pub(crate) async fn sender_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    subscriber: Arc<Subscriber>,
    stats: Arc<BrokerStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            result = shutdown.recv() => {
                match result {
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    _ => break,
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let result = timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await;
                subscriber.record_send();
                stats.record_send();
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        subscriber.record_failure();
                        stats.record_send_failure();
                        warn!("write to {} failed: {}", subscriber.addr, e);
                    }
                    Err(_) => {
                        subscriber.record_failure();
                        stats.record_send_failure();
                        warn!("write to {} timed out", subscriber.addr);
                    }
                }
            }
        }
    }
}
