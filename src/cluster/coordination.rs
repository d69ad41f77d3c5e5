//! Coordination backend contract
//!
//! Everything the coordinator needs from a coordination service: sessions,
//! a session-bound lock, and a service registry. The production backend
//! speaks the Consul HTTP API; tests substitute an in-memory one.

use std::fmt;

use async_trait::async_trait;

/// A service entry as this node registers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Stable identity; re-registering the same id updates in place.
    pub id: String,
    /// Shared by every node of one cluster.
    pub name: String,
    /// `[is_leader, node_key, last_heartbeat_unix, hostname, lock_key]`.
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
}

/// A service entry as listed back from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub id: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
}

/// Backend operations behind the [`Coordinator`](super::Coordinator).
///
/// Locks are bound to sessions: when a session dies, the service deletes
/// the locks it held, which is what lets a crashed leader be replaced
/// without manual cleanup.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Create a session whose locks are deleted when it ends.
    async fn create_session(&self) -> Result<String, CoordinationError>;

    async fn renew_session(&self, session: &str) -> Result<(), CoordinationError>;

    async fn destroy_session(&self, session: &str) -> Result<(), CoordinationError>;

    /// Try to take `key` for `session`. `false` means another session
    /// holds it.
    async fn acquire(&self, key: &str, session: &str) -> Result<bool, CoordinationError>;

    /// Give `key` back. `false` means `session` did not hold it.
    async fn release(&self, key: &str, session: &str) -> Result<bool, CoordinationError>;

    /// Remove `key` outright, whoever holds it.
    async fn delete(&self, key: &str) -> Result<(), CoordinationError>;

    /// Create or update a service entry, keyed by its id.
    async fn register_service(
        &self,
        service: &ServiceRegistration,
    ) -> Result<(), CoordinationError>;

    async fn deregister_service(&self, id: &str) -> Result<(), CoordinationError>;

    async fn list_services(&self) -> Result<Vec<RegisteredService>, CoordinationError>;
}

/// Errors from the coordination backend.
#[derive(Debug)]
pub enum CoordinationError {
    /// Transport failure reaching the backend.
    Http(reqwest::Error),
    /// The backend answered with a non-success status.
    Api { status: u16, body: String },
    /// The backend answered something unparsable.
    InvalidResponse(String),
}

impl CoordinationError {
    /// Whether this failure implicates the session itself. Session trouble
    /// is the one condition the coordinator reacts to automatically, by
    /// recreating the session; everything else waits for the next tick.
    pub fn is_session_error(&self) -> bool {
        self.to_string().to_lowercase().contains("session")
    }
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::Http(e) => write!(f, "coordination request failed: {e}"),
            CoordinationError::Api { status, body } => {
                write!(f, "coordination service answered {status}: {body}")
            }
            CoordinationError::InvalidResponse(msg) => {
                write!(f, "invalid coordination response: {msg}")
            }
        }
    }
}

impl std::error::Error for CoordinationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinationError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CoordinationError {
    fn from(e: reqwest::Error) -> Self {
        CoordinationError::Http(e)
    }
}
