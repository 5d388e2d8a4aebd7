//! Error types for topology coordination
//!
//! Every failure that can cross a node boundary is a `TopologyError`, so the
//! type is serializable and travels back to remote callers as a response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::NodeId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors raised by the coordinator and member topology services
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TopologyError {
    /// Join refused because persisted state is incompatible with the cache
    #[error("join rejected for cache '{cache_name}': {reason}")]
    JoinRejected { cache_name: String, reason: String },

    /// Topology update or confirmation older than what is already applied
    #[error("stale update for cache '{cache_name}': received {received}, current {current}")]
    StaleUpdate {
        cache_name: String,
        received: u32,
        current: u32,
    },

    /// A view, join response or status response did not arrive in time
    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    /// Not every member recorded in persisted state has rejoined
    #[error("cache '{cache_name}' is missing persisted members: {missing:?}")]
    MissingMembers {
        cache_name: String,
        missing: Vec<String>,
    },

    /// The target of a remote call left the view while the call was running
    #[error("node {node} is suspected")]
    SuspectedNode { node: NodeId },

    /// The local service is not running or already shutting down
    #[error("illegal lifecycle state: {0}")]
    IllegalLifecycleState(String),

    /// The receiving node cannot act as coordinator right now
    #[error("node {node} is not acting as coordinator")]
    NotCoordinator { node: NodeId },

    #[error("cache '{0}' not found")]
    CacheNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TopologyError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Timeouts and a coordinator that is still recovering are the common
    /// transient causes right after a coordinator change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TopologyError::Timeout { .. }
                | TopologyError::SuspectedNode { .. }
                | TopologyError::NotCoordinator { .. }
                | TopologyError::Transport(_)
        )
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        TopologyError::Timeout {
            operation: operation.into(),
        }
    }
}

impl From<bincode::Error> for TopologyError {
    fn from(err: bincode::Error) -> Self {
        TopologyError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        TopologyError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TopologyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TopologyError::timeout("remote response")
    }
}
