//! Wire frame codec
//!
//! Every message exchanged over TCP (subscriber traffic, forwarding-agent
//! traffic, control channel) shares one framing:
//!
//! ```text
//! bytes[0..4)   payload length L (includes the 2 command bytes), little-endian
//! bytes[4..6)   command code, little-endian
//! bytes[6..4+L) payload
//! ```
//!
//! A frame is complete once `4 + L` bytes are buffered. [`FrameAssembler`]
//! performs incremental reassembly from a streaming byte source and applies
//! the lossy-recovery policy for garbled peers.


use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

/// Fixed frame header: 4-byte length + 2-byte command.
pub const HEADER_LEN: usize = 6;

/// Reassembly ceiling for broker-side connections. Subscribers only ever send
/// small handshake and keepalive frames, so anything that buffers past this
/// without completing a frame is garbage.
pub const DEFAULT_ASSEMBLY_LIMIT: usize = 4096;

/// Reassembly ceiling for agent-side connections, which receive full `EVENT`
/// frames of arbitrary row size.
pub const AGENT_ASSEMBLY_LIMIT: usize = 16 * 1024 * 1024;

/// Command codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Join a subscriber group (first frame of a subscriber handshake).
    SetGroup = 1,
    /// Authentication (recognized, not supported).
    Auth = 2,
    /// Generic success response.
    Ok = 3,
    /// Error response with a human-readable message payload.
    Error = 4,
    /// Client-originated keepalive.
    Tick = 5,
    /// A rendered row-change event.
    Event = 6,
    /// Register as a mirror (first frame of a forwarding-agent handshake).
    Agent = 7,
    /// Control: stop the node.
    Stop = 8,
    /// Control: reload sinks.
    Reload = 9,
    /// Control: dump the cluster membership table.
    ShowMembers = 10,
    /// Replication position broadcast (leader -> mirrors).
    Pos = 11,
}

impl Command {
    /// Map a raw wire code back to a known command.
    pub fn from_u16(value: u16) -> Option<Command> {
        match value {
            1 => Some(Command::SetGroup),
            2 => Some(Command::Auth),
            3 => Some(Command::Ok),
            4 => Some(Command::Error),
            5 => Some(Command::Tick),
            6 => Some(Command::Event),
            7 => Some(Command::Agent),
            8 => Some(Command::Stop),
            9 => Some(Command::Reload),
            10 => Some(Command::ShowMembers),
            11 => Some(Command::Pos),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// One decoded wire frame.
///
/// `command` is kept raw so unknown codes survive decoding and can be
/// answered with an error instead of killing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub payload: Bytes,
}

impl Frame {
    /// The known command this frame carries, if any.
    #[inline]
    pub fn kind(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }
}

/// Encode a frame. The length field counts the payload plus the 2 command
/// bytes.
pub fn pack(command: Command, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32 + 2);
    buf.put_u16_le(command.as_u16());
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a frame with a string payload.
#[inline]
pub fn pack_str(command: Command, payload: &str) -> Bytes {
    pack(command, payload.as_bytes())
}

/// Encode a `SET_GROUP` payload: `[4-byte weight, LE][group name bytes]`.
pub fn encode_set_group(weight: u32, group: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + group.len());
    buf.put_u32_le(weight);
    buf.put_slice(group.as_bytes());
    buf.freeze()
}

/// Parse a `SET_GROUP` payload into `(weight, group name)`.
pub fn parse_set_group(payload: &[u8]) -> Result<(u32, &str), FrameError> {
    if payload.len() < 4 {
        return Err(FrameError::Truncated("set-group payload"));
    }
    let weight = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let group = std::str::from_utf8(&payload[4..]).map_err(|_| FrameError::InvalidUtf8)?;
    Ok((weight, group))
}

/// Incremental frame reassembly over a persistent per-connection buffer.
///
/// `feed` appends a chunk and greedily extracts every complete frame. A
/// trailing partial frame stays buffered for the next chunk. If the residual
/// buffer grows past the configured ceiling without completing a frame it is
/// discarded and reassembly restarts; the caller sees no error, only a gap.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    limit: usize,
}

impl FrameAssembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Bytes currently buffered waiting for a frame to complete.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and extract every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let declared =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if declared < 2 {
                // A length that cannot even cover the command bytes means the
                // stream is desynchronized; resync by discarding.
                debug!(declared, "garbled frame length, discarding buffer");
                self.buf.clear();
                break;
            }
            let total = 4 + declared;
            if self.buf.len() < total {
                break;
            }
            let mut frame = self.buf.split_to(total);
            frame.advance(4);
            let command = frame.get_u16_le();
            frames.push(Frame {
                command,
                payload: frame.freeze(),
            });
        }
        if self.buf.len() > self.limit {
            debug!(
                buffered = self.buf.len(),
                limit = self.limit,
                "reassembly buffer over limit without a complete frame, discarding"
            );
            self.buf.clear();
        }
        frames
    }
}

/// Errors from parsing frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload shorter than its fixed fields require.
    Truncated(&'static str),
    /// Payload text is not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(what) => write!(f, "truncated {}", what),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 payload"),
        }
    }
}

impl std::error::Error for FrameError {}
