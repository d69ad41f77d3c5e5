//! Event dispatch from the replication source into the engine
//!
//! The engine never speaks a replication protocol itself. An external source
//! adapter owns the upstream connection and drives the callback contract
//! defined here. The dispatcher stamps each row change with the process-wide
//! monotonic event index, renders the JSON payload, and fans it out to every
//! registered sink; position-sync callbacks persist the checkpoint and
//! broadcast the encoded record so mirror nodes track the leader's position.


use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use crate::checkpoint::{CheckpointError, CheckpointStore, Position};
use crate::event::RowEvent;
use crate::sink::SinkSet;

/// Contract between a replication source adapter and the engine.
///
/// Adapters own the upstream protocol and its reconnect policy; the engine
/// supplies the resume position and consumes the callbacks until the adapter
/// returns or the task driving it is dropped.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Stream changes into `dispatcher`, starting at `from`.
    async fn run(&self, from: Position, dispatcher: Arc<EventDispatcher>) -> std::io::Result<()>;
}

/// Translates source callbacks into sink deliveries.
///
/// The event index is seeded from the checkpoint at startup and owned here
/// afterwards; every logical change (one row, or one before/after pair for
/// updates) consumes exactly one index.
pub struct EventDispatcher {
    sinks: Arc<SinkSet>,
    checkpoint: Arc<CheckpointStore>,
    event_index: AtomicI64,
}

impl EventDispatcher {
    pub fn new(sinks: Arc<SinkSet>, checkpoint: Arc<CheckpointStore>, start_index: i64) -> Self {
        Self {
            sinks,
            checkpoint,
            event_index: AtomicI64::new(start_index),
        }
    }

    /// Current value of the monotonic event counter.
    pub fn event_index(&self) -> i64 {
        self.event_index.load(Ordering::SeqCst)
    }

    /// A row change arrived. Renders one payload per logical change and
    /// notifies the sink set with the combined `schema.table` key. Returns
    /// the total number of sink accepts across all rendered payloads.
    pub async fn on_row(&self, event: &RowEvent) -> usize {
        let table = event.table_key();
        let payloads = event.render(
            || self.event_index.fetch_add(1, Ordering::SeqCst) + 1,
            unix_now(),
        );
        let mut accepted = 0;
        for payload in &payloads {
            accepted += self.sinks.notify(&table, payload).await;
        }
        accepted
    }

    /// The source rotated to a new file. Nothing is persisted here; the
    /// position-sync that follows the rotation carries the new file name.
    pub fn on_rotate(&self, file: &str) {
        debug!(file, "source rotated");
    }

    /// A schema-change statement passed by. Observed only.
    pub fn on_ddl(&self, schema: &str, statement: &str) {
        debug!(schema, statement, "ddl observed");
    }

    /// The source confirmed a durable position. Persists the checkpoint with
    /// the current event index, then broadcasts the encoded record through
    /// the sink set so connected mirrors can update their own checkpoints.
    pub async fn on_pos_synced(&self, file: &str, offset: i64) -> Result<(), CheckpointError> {
        let position = Position::new(file, offset, self.event_index());
        self.checkpoint.save(&position)?;
        self.sinks.send_pos(&position.encode()).await;
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
