//! Mapping between transient addresses and persistent identities
//!
//! Shared by every cache on a node. Entries are added as addresses are
//! observed (joins, cluster recovery) and looked up whenever ownership has
//! to be expressed independently of the current addresses.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::consistent_hash::ConsistentHash;
use super::{NodeId, PersistentId};

#[derive(Debug, Default)]
struct IdentityMaps {
    address_to_persistent: HashMap<NodeId, PersistentId>,
    persistent_to_address: HashMap<PersistentId, NodeId>,
}

/// Bidirectional `NodeId <-> PersistentId` map
#[derive(Debug, Default)]
pub struct PersistentIdentityManager {
    maps: RwLock<IdentityMaps>,
}

impl PersistentIdentityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `address` currently carries `persistent_id`.
    ///
    /// A node restarting under a new address replaces its old mapping.
    pub fn add_persistent_address_mapping(&self, address: NodeId, persistent_id: PersistentId) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = maps.address_to_persistent.insert(address.clone(), persistent_id) {
            if previous != persistent_id {
                maps.persistent_to_address.remove(&previous);
            }
        }
        if let Some(previous) = maps.persistent_to_address.insert(persistent_id, address.clone()) {
            if previous != address {
                maps.address_to_persistent.remove(&previous);
                tracing::debug!(
                    "Persistent identity {} moved from {} to {}",
                    persistent_id,
                    previous,
                    address
                );
            }
        }
    }

    pub fn get_persistent_id(&self, address: &NodeId) -> Option<PersistentId> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.address_to_persistent.get(address).copied()
    }

    pub fn get_address(&self, persistent_id: &PersistentId) -> Option<NodeId> {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.persistent_to_address.get(persistent_id).cloned()
    }

    /// Re-associate persisted ownership with the addresses now in use
    pub fn to_addresses(&self, ch: &ConsistentHash<PersistentId>) -> Option<ConsistentHash> {
        ch.remap(|persistent_id| self.get_address(persistent_id))
    }

    pub fn len(&self) -> usize {
        let maps = self.maps.read().unwrap_or_else(PoisonError::into_inner);
        maps.address_to_persistent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::consistent_hash::{ConsistentHashFactory, RingConsistentHashFactory};
    use std::sync::Arc;

    #[test]
    fn test_restart_under_new_address_replaces_mapping() {
        let identities = PersistentIdentityManager::new();
        let pid = PersistentId::from_u128(7);

        identities.add_persistent_address_mapping(NodeId::from("a:1"), pid);
        identities.add_persistent_address_mapping(NodeId::from("a:2"), pid);

        assert_eq!(identities.get_address(&pid), Some(NodeId::from("a:2")));
        assert_eq!(identities.get_persistent_id(&NodeId::from("a:1")), None);
        assert_eq!(identities.len(), 1);
    }

    #[test]
    fn test_ownership_round_trip_through_persistent_ids() {
        let identities = PersistentIdentityManager::new();
        identities.add_persistent_address_mapping(NodeId::from("a"), PersistentId::from_u128(1));
        identities.add_persistent_address_mapping(NodeId::from("b"), PersistentId::from_u128(2));

        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(2, 8, &[NodeId::from("a"), NodeId::from("b")], &HashMap::new());
        let persisted = ch.remap(|address| identities.get_persistent_id(address)).unwrap();

        // Both nodes come back under new addresses.
        identities.add_persistent_address_mapping(NodeId::from("a2"), PersistentId::from_u128(1));
        identities.add_persistent_address_mapping(NodeId::from("b2"), PersistentId::from_u128(2));
        let restored = identities.to_addresses(&persisted).unwrap();

        assert_eq!(restored.members(), &[NodeId::from("a2"), NodeId::from("b2")][..]);
        for segment in 0..8 {
            assert_eq!(restored.segment_owners(segment).len(), 2);
        }
    }

    #[test]
    fn test_missing_mapping_prevents_remap() {
        let identities = PersistentIdentityManager::new();
        identities.add_persistent_address_mapping(NodeId::from("a"), PersistentId::from_u128(1));

        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(1, 4, &[NodeId::from("x"), NodeId::from("y")], &HashMap::new());
        let persisted = ch
            .remap(|address| Some(PersistentId::from_u128(if address.as_str() == "x" { 1 } else { 2 })))
            .unwrap();

        // Identity 2 has no live address.
        assert!(identities.to_addresses(&persisted).is_none());
        assert!(ch.remap(|address| identities.get_persistent_id(address)).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_readers_and_writer() {
        let identities = Arc::new(PersistentIdentityManager::new());
        let mut handles = Vec::new();
        for i in 0..8u128 {
            let identities = Arc::clone(&identities);
            handles.push(tokio::spawn(async move {
                let address = NodeId::new(format!("n{}", i));
                identities.add_persistent_address_mapping(address.clone(), PersistentId::from_u128(i));
                identities.get_persistent_id(&address)
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(PersistentId::from_u128(i as u128)));
        }
        assert_eq!(identities.len(), 8);
    }
}
