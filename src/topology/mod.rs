//! Topology value types
//!
//! Identities, ownership descriptors and the versioned `CacheTopology`
//! exchanged between the coordinator and the members.

pub mod cache_topology;
pub mod consistent_hash;
pub mod identity;
pub mod persistent_state;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use cache_topology::{
    AvailabilityMode, CacheJoinInfo, CacheMode, CacheStatusResponse, CacheTopology,
    ManagerStatusResponse, PartitionHandling, Phase,
};
pub use consistent_hash::{ConsistentHash, ConsistentHashFactory, RingConsistentHashFactory};
pub use identity::PersistentIdentityManager;
pub use persistent_state::ScopedPersistentState;

/// Monotonic version of a cache topology
pub type TopologyId = u32;

/// Version of a rebalance, bumped only when a new rebalance starts
pub type RebalanceId = u32;

/// Membership view number delivered by the membership service
pub type ViewId = u64;

/// Transient network address of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Restart-stable identity of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistentId(u128);

impl PersistentId {
    /// Generate a fresh random identity
    pub fn random() -> Self {
        PersistentId(rand::random())
    }

    pub const fn from_u128(value: u128) -> Self {
        PersistentId(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentId({})", self)
    }
}

impl FromStr for PersistentId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(PersistentId(u128::from_be_bytes(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_id_hex_round_trip() {
        let id = PersistentId::from_u128(0xdead_beef);
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<PersistentId>().unwrap(), id);
        assert!("xyz".parse::<PersistentId>().is_err());
    }

    #[test]
    fn test_node_id_conversions() {
        let a = NodeId::from("node-a");
        assert_eq!(a.as_str(), "node-a");
        assert_eq!(a, NodeId::new(String::from("node-a")));
        assert_eq!(format!("{}", a), "node-a");
    }
}
