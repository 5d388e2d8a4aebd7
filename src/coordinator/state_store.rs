//! Persisted ownership known to the coordinator after a cluster restart

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::topology::ScopedPersistentState;

/// Source of the ownership recorded by the last graceful shutdown.
///
/// A cache with recorded state only admits joiners carrying the same
/// checksum, and restores the recorded ownership once every recorded member
/// has rejoined.
pub trait PersistentStateStore: Send + Sync {
    fn load(&self, cache_name: &str) -> Option<ScopedPersistentState>;

    fn store(&self, state: ScopedPersistentState);

    /// Forget the state once it has been restored
    fn remove(&self, cache_name: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, ScopedPersistentState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStateStore for InMemoryStateStore {
    fn load(&self, cache_name: &str) -> Option<ScopedPersistentState> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states.get(cache_name).cloned()
    }

    fn store(&self, state: ScopedPersistentState) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        states.insert(state.cache_name.clone(), state);
    }

    fn remove(&self, cache_name: &str) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        states.remove(cache_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ConsistentHash, PersistentId};

    #[test]
    fn test_store_load_remove() {
        let store = InMemoryStateStore::new();
        let ch = ConsistentHash::new(
            1,
            vec![PersistentId::from_u128(1)],
            vec![1.0],
            vec![vec![PersistentId::from_u128(1)]; 4],
        );
        let state = ScopedPersistentState::new("users", 3, ch).unwrap();
        store.store(state.clone());

        assert_eq!(store.load("users"), Some(state));
        assert_eq!(store.load("orders"), None);
        store.remove("users");
        assert_eq!(store.load("users"), None);
    }
}
