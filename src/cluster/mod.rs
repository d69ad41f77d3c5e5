//! Cluster coordination
//!
//! Exactly one node may consume the replication stream at a time. The
//! coordinator elects that node through a distributed lock bound to a
//! coordination-service session, and makes every node discoverable through
//! per-node service registrations carrying heartbeat tags:
//!
//! - **Election**: followers retry [`Coordinator::acquire_lock`]; holding
//!   the lock is what makes a node the leader.
//! - **Membership**: nodes re-register themselves on every heartbeat;
//!   [`Coordinator::membership`] derives the live view from the registry.
//! - **Recovery**: a health loop probes suspect members, evicts the dead,
//!   and force-deletes the lock on dead-leader, zero-leader and split-brain
//!   states so a fresh election can happen.
//!
//! The backend is the [`Coordination`] trait; production nodes use the
//! Consul HTTP API through [`ConsulCoordination`].

mod consul;
mod coordination;
mod coordinator;
mod member;


pub use consul::ConsulCoordination;
pub use coordination::{Coordination, CoordinationError, RegisteredService, ServiceRegistration};
pub use coordinator::{Coordinator, NodeStatus, Participation, Role};
pub use member::{ClusterMember, Liveness};
