//! Uniform sink capability and the named-sink registry.
//!
//! Every consumer of rendered row events sits behind [`EventSink`]: the
//! broadcast broker, the forwarding agent's re-notify target, and any
//! external adapter (HTTP, Redis, ...) built on top of this crate. The
//! dispatcher only ever talks to the [`SinkSet`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};


/// A named consumer of rendered events.
///
/// `send_all`/`send_pos` return `false` when the sink did not take the
/// event: disabled, shut down, or no connected consumer to hand it to.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one rendered event for `table` (combined `schema.table` key).
    async fn send_all(&self, table: &str, payload: &[u8]) -> bool;

    /// Deliver an encoded position record to position-interested consumers.
    async fn send_pos(&self, _record: &[u8]) -> bool {
        true
    }

    async fn start(&self) {}

    async fn close(&self) {}

    async fn reload(&self) {}
}

/// Registry of sinks keyed by name. Registration order is not significant;
/// every notification fans out to all current members.
#[derive(Default)]
pub struct SinkSet {
    sinks: DashMap<String, Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        let name = sink.name().to_string();
        info!("sink registered: {}", name);
        self.sinks.insert(name, sink);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn EventSink>> {
        self.sinks.remove(name).map(|(_, sink)| sink)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Fan one rendered event out to every sink. Returns how many accepted.
    pub async fn notify(&self, table: &str, payload: &[u8]) -> usize {
        let mut accepted = 0;
        for sink in self.snapshot() {
            if sink.send_all(table, payload).await {
                accepted += 1;
            } else {
                debug!("sink {} declined event for {}", sink.name(), table);
            }
        }
        accepted
    }

    /// Fan an encoded position record out to every sink.
    pub async fn send_pos(&self, record: &[u8]) -> usize {
        let mut accepted = 0;
        for sink in self.snapshot() {
            if sink.send_pos(record).await {
                accepted += 1;
            }
        }
        accepted
    }

    pub async fn start_all(&self) {
        for sink in self.snapshot() {
            sink.start().await;
        }
    }

    pub async fn close_all(&self) {
        for sink in self.snapshot() {
            sink.close().await;
        }
    }

    pub async fn reload_all(&self) {
        for sink in self.snapshot() {
            sink.reload().await;
        }
    }

    // Sends await, so they must not run under a shard lock.
    fn snapshot(&self) -> Vec<Arc<dyn EventSink>> {
        self.sinks.iter().map(|e| e.value().clone()).collect()
    }
}
