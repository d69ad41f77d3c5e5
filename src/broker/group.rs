//! Subscriber groups and the distribution policies over them
//!
//! A group is a named, configured set of subscriber connections with one
//! distribution mode. Broadcast groups enqueue every event on every connected
//! member; weighted groups pick a single member per event based on how far
//! each member's delivery count lags its share of the traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use compact_str::CompactString;
use regex::Regex;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::GroupMode;

/// One subscriber connection as the distribution side sees it.
///
/// Created at accept time; joins a group only after a successful handshake.
/// The reader task owns the socket; everything pushed to the peer goes
/// through `tx` into the connection's dedicated sender loop.
#[derive(Debug)]
pub struct Subscriber {
    pub id: u64,
    pub addr: SocketAddr,
    raw_weight: AtomicU32,
    weight: AtomicU32,
    sent: AtomicU64,
    failures: AtomicU64,
    connected: AtomicBool,
    tx: mpsc::Sender<Bytes>,
}

impl Subscriber {
    pub fn new(id: u64, addr: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            addr,
            raw_weight: AtomicU32::new(0),
            weight: AtomicU32::new(0),
            sent: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            tx,
        }
    }

    /// The weight the client asked for, before renormalization.
    pub fn raw_weight(&self) -> u32 {
        self.raw_weight.load(Ordering::Relaxed)
    }

    pub fn set_raw_weight(&self, weight: u32) {
        self.raw_weight.store(weight, Ordering::Relaxed);
    }

    /// The effective weight after the group renormalized to a 100 total.
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Delivery attempts so far, successful or not.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Mark the connection dead. Distribution skips it from here on; the
    /// reader task removes it from its group when it unwinds.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Queue a frame without blocking. A full queue drops the frame for this
    /// subscriber only and counts it as a failure.
    pub fn try_enqueue(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_failure();
                warn!(
                    subscriber = self.id,
                    addr = %self.addr,
                    "send queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_failure();
                false
            }
        }
    }
}

/// A named set of subscribers sharing one distribution policy and filter.
#[derive(Debug)]
pub struct Group {
    pub name: CompactString,
    pub mode: GroupMode,
    filters: Vec<Regex>,
    members: SmallVec<[Arc<Subscriber>; 4]>,
}

impl Group {
    pub fn new(name: impl Into<CompactString>, mode: GroupMode, filters: Vec<Regex>) -> Self {
        Self {
            name: name.into(),
            mode,
            filters,
            members: SmallVec::new(),
        }
    }

    /// Whether this group wants events for `table`. An empty filter list
    /// matches everything.
    pub fn matches(&self, table: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.is_match(table))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn connected_members(&self) -> impl Iterator<Item = &Arc<Subscriber>> {
        self.members.iter().filter(|m| m.is_connected())
    }

    pub fn add_member(&mut self, subscriber: Arc<Subscriber>) {
        self.members.push(subscriber);
        if self.mode == GroupMode::Weight {
            self.renormalize();
        }
    }

    /// Drop `id` from the group. Returns whether it was a member.
    pub fn remove_member(&mut self, id: u64) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id != id);
        let removed = self.members.len() != before;
        if removed && self.mode == GroupMode::Weight {
            self.renormalize();
        }
        removed
    }

    /// Recompute effective weights so the group always sums to exactly 100.
    ///
    /// Every member gets `floor(raw * 100 / total)` except the last, which
    /// takes the remainder. A raw weight of 0 counts as 100 in the total but
    /// keeps its own zero numerator, so zero-weight members only ever receive
    /// the trailing remainder.
    fn renormalize(&mut self) {
        let Some(last) = self.members.len().checked_sub(1) else {
            return;
        };
        let mut total: u64 = 0;
        for member in &self.members {
            let raw = member.raw_weight();
            total += if raw == 0 { 100 } else { u64::from(raw) };
        }
        let mut assigned: u32 = 0;
        for (idx, member) in self.members.iter().enumerate() {
            if idx == last {
                member.set_weight(100 - assigned);
            } else {
                let share = (u64::from(member.raw_weight()) * 100 / total) as u32;
                member.set_weight(share);
                assigned += share;
            }
        }
    }

    /// Pick the weighted-mode target: the connected member minimizing
    /// `sent / weight`, preferring any member that has never been sent to.
    pub fn pick_target(&self) -> Option<Arc<Subscriber>> {
        let mut connected = self.members.iter().filter(|m| m.is_connected());
        let mut target = connected.next()?;
        let mut ratio = target.sent() as f64 / f64::from(target.weight());
        for member in connected {
            let sent = member.sent();
            if sent == 0 {
                target = member;
                break;
            }
            let candidate = sent as f64 / f64::from(member.weight());
            if candidate < ratio {
                ratio = candidate;
                target = member;
            }
        }
        Some(Arc::clone(target))
    }
}
