//! Durable replication position checkpoint.
//!
//! A single fixed-layout record overwritten in place at offset 0:
//! `[u16 total length][i64 offset][i64 event index][file name bytes]`,
//! all little-endian. The total length covers the 16 fixed bytes plus the
//! name. The same record is the payload of `POS` frames, so followers
//! persist exactly the bytes the leader wrote.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Length-prefix bytes ahead of the record body.
const PREFIX_LEN: usize = 2;
/// Fixed body bytes: offset + event index.
const FIXED_LEN: usize = 16;

/// A replication position: where in which source file to resume, plus the
/// last event index handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub file: String,
    pub offset: i64,
    pub event_index: i64,
}

impl Position {
    pub fn new(file: impl Into<String>, offset: i64, event_index: i64) -> Self {
        Self {
            file: file.into(),
            offset,
            event_index,
        }
    }

    /// No checkpoint has ever been written. The source adapter starts from
    /// the current head instead of resuming.
    pub fn is_initial(&self) -> bool {
        self.file.is_empty()
    }

    /// Serialize to the on-disk / `POS`-frame record layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + FIXED_LEN + self.file.len());
        buf.put_u16_le((FIXED_LEN + self.file.len()) as u16);
        buf.put_i64_le(self.offset);
        buf.put_i64_le(self.event_index);
        buf.put_slice(self.file.as_bytes());
        buf.freeze()
    }

    /// Parse a record, tolerating trailing garbage beyond the declared
    /// length (stale bytes from a longer previous record).
    pub fn decode(buf: &[u8]) -> Result<Self, CheckpointError> {
        if buf.len() < PREFIX_LEN {
            return Err(CheckpointError::Truncated {
                needed: PREFIX_LEN,
                have: buf.len(),
            });
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared < FIXED_LEN {
            return Err(CheckpointError::ShortRecord(declared));
        }
        let total = PREFIX_LEN + declared;
        if buf.len() < total {
            return Err(CheckpointError::Truncated {
                needed: total,
                have: buf.len(),
            });
        }
        let mut body = &buf[PREFIX_LEN..total];
        let offset = body.get_i64_le();
        let event_index = body.get_i64_le();
        let file = String::from_utf8_lossy(body).into_owned();
        Ok(Self {
            file,
            offset,
            event_index,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} #{}", self.file, self.offset, self.event_index)
    }
}

/// Synchronous single-record store. `save` must be durable before the
/// triggering event is acknowledged upstream, so every write runs through
/// `sync_data` and failures surface to the caller.
pub struct CheckpointStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint file. Failure here is fatal at
    /// startup: a node that cannot persist positions must not take writes.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Overwrite the record from offset 0 and flush it to disk.
    pub fn save(&self, pos: &Position) -> Result<(), CheckpointError> {
        let record = pos.encode();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&record)?;
        file.set_len(record.len() as u64)?;
        file.sync_data()?;
        debug!("checkpoint saved: {}", pos);
        Ok(())
    }

    /// Read the current record. An empty, truncated, or unreadable file
    /// yields the zero position rather than an error.
    pub fn load(&self) -> Position {
        let buf = match self.read_back() {
            Ok(buf) => buf,
            Err(e) => {
                warn!(
                    "checkpoint {} unreadable, starting from zero: {}",
                    self.path.display(),
                    e
                );
                return Position::default();
            }
        };
        if buf.is_empty() {
            return Position::default();
        }
        match Position::decode(&buf) {
            Ok(pos) => pos,
            Err(e) => {
                warn!(
                    "checkpoint {} corrupt, starting from zero: {}",
                    self.path.display(),
                    e
                );
                Position::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_back(&self) -> std::io::Result<Vec<u8>> {
        let mut file = self.file.lock();
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Errors from the checkpoint store and record codec.
#[derive(Debug)]
pub enum CheckpointError {
    /// IO error
    Io(std::io::Error),
    /// Record shorter than its declared length
    Truncated { needed: usize, have: usize },
    /// Declared length smaller than the fixed fields
    ShortRecord(usize),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Truncated { needed, have } => {
                write!(f, "record truncated: need {} bytes, have {}", needed, have)
            }
            Self::ShortRecord(len) => {
                write!(f, "record length {} shorter than fixed fields", len)
            }
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
