//! Rowcast - replicated row-change event distribution engine
//!
//! Consumes a database replication stream on exactly one leader-elected
//! node, renders each row change as JSON, and fans the events out to TCP
//! subscriber groups in broadcast or weighted mode. Followers mirror the
//! leader's stream so their local consumers stay current, and a durable
//! checkpoint lets whichever node leads next resume where the last one
//! stopped.

pub mod agent;
pub mod broker;
pub mod checkpoint;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod event;
pub mod node;
pub mod sink;
pub mod source;

pub use agent::{AgentStatus, ForwardingAgent, LeaderResolver};
pub use broker::{Broker, MembersProvider};
pub use checkpoint::{CheckpointStore, Position};
pub use cluster::{ClusterMember, ConsulCoordination, Coordination, Coordinator, Role};
pub use codec::{Command, Frame, FrameAssembler};
pub use config::Config;
pub use event::{ColumnKind, ColumnMeta, ColumnValue, EventEnvelope, EventKind, RowEvent};
pub use node::{Node, NodeError};
pub use sink::{EventSink, SinkSet};
pub use source::{EventDispatcher, ReplicationSource};
