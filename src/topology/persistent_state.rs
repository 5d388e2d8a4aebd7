//! Address-independent record of a cache's ownership, written on a graceful
//! cluster-wide shutdown and validated when nodes rejoin after a restart.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::consistent_hash::ConsistentHash;
use super::{PersistentId, TopologyId};
use crate::error::{Result, TopologyError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedPersistentState {
    pub cache_name: String,
    pub topology_id: TopologyId,
    pub consistent_hash: ConsistentHash<PersistentId>,
    pub checksum: String,
}

impl ScopedPersistentState {
    pub fn new(
        cache_name: impl Into<String>,
        topology_id: TopologyId,
        consistent_hash: ConsistentHash<PersistentId>,
    ) -> Result<Self> {
        let checksum = Self::compute_checksum(&consistent_hash)?;
        Ok(Self {
            cache_name: cache_name.into(),
            topology_id,
            consistent_hash,
            checksum,
        })
    }

    /// SHA-256 of the encoded ownership, hex encoded.
    ///
    /// Every node of a cleanly stopped cluster records the same ownership, so
    /// they all compute the same checksum, and it stays valid across restarts.
    pub fn compute_checksum(consistent_hash: &ConsistentHash<PersistentId>) -> Result<String> {
        let bytes = bincode::serialize(consistent_hash)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Persistent identities that must rejoin before the state can be restored
    pub fn members(&self) -> &[PersistentId] {
        self.consistent_hash.members()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and verify a persisted record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: ScopedPersistentState = bincode::deserialize(bytes)?;
        let expected = Self::compute_checksum(&state.consistent_hash)?;
        if expected != state.checksum {
            return Err(TopologyError::Serialization(format!(
                "checksum mismatch in persisted state of cache '{}'",
                state.cache_name
            )));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ownership(owner: u128) -> ConsistentHash<PersistentId> {
        let id = PersistentId::from_u128(owner);
        ConsistentHash::new(1, vec![id], vec![1.0], vec![vec![id]; 4])
    }

    #[test]
    fn test_checksum_depends_on_ownership() {
        let a = ScopedPersistentState::new("users", 3, ownership(1)).unwrap();
        let b = ScopedPersistentState::new("users", 9, ownership(1)).unwrap();
        let c = ScopedPersistentState::new("users", 3, ownership(2)).unwrap();

        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
        assert_eq!(a.members(), &[PersistentId::from_u128(1)][..]);
    }

    #[test]
    fn test_checksum_is_stable() {
        let state = ScopedPersistentState::new("users", 3, ownership(1)).unwrap();
        assert_eq!(
            state.checksum,
            "898e984cd1317c155c3471f907f41c6460be2a314223e2b683d9f127bea83b52"
        );
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut state = ScopedPersistentState::new("users", 3, ownership(1)).unwrap();
        let decoded = ScopedPersistentState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, state);

        state.checksum = "0000".to_string();
        let err = ScopedPersistentState::from_bytes(&state.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, TopologyError::Serialization(_)));
    }
}
