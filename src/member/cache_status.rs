//! Member-side state of one cache and the hooks into the data layer

use async_trait::async_trait;
use std::sync::Arc;

use crate::cluster::{Transport, ViewTracker};
use crate::error::{Result, TopologyError};
use crate::protocol::{ControlCommand, ControlMessage};
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ScopedPersistentState,
    TopologyId,
};

/// Callbacks through which the topology service drives the local cache.
///
/// Calls for one cache are never concurrent and arrive in topology order.
#[async_trait]
pub trait CacheTopologyHandler: Send + Sync {
    /// Install a topology that does not start a new state transfer
    async fn update_consistent_hash(&self, topology: &CacheTopology);

    /// Start the state transfer for a new rebalance. The transfer is
    /// finished once `confirmation` is confirmed.
    async fn rebalance(&self, topology: &CacheTopology, confirmation: PhaseConfirmation);

    async fn update_availability_mode(&self, _mode: AvailabilityMode) {}

    /// Write the ownership recorded by a cluster-wide shutdown
    async fn persist_state(&self, _state: ScopedPersistentState) -> Result<()> {
        Ok(())
    }
}

/// One-shot token confirming a rebalance phase to the coordinator
pub struct PhaseConfirmation {
    cache_name: String,
    topology_id: TopologyId,
    transport: Arc<dyn Transport>,
    views: ViewTracker,
}

impl PhaseConfirmation {
    pub(crate) fn new(
        cache_name: impl Into<String>,
        topology_id: TopologyId,
        transport: Arc<dyn Transport>,
        views: ViewTracker,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            topology_id,
            transport,
            views,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Report the outcome of the local state transfer. A failed transfer is
    /// still confirmed, carrying its error for the coordinator's log.
    pub async fn confirm(self, error: Option<String>) -> Result<()> {
        let view = self
            .views
            .current()
            .ok_or_else(|| TopologyError::IllegalLifecycleState("no view installed".to_string()))?;
        let coordinator = view
            .coordinator()
            .cloned()
            .ok_or_else(|| TopologyError::Internal(format!("view {} has no members", view.view_id)))?;
        tracing::debug!(
            "Confirming topology {} of cache {} to {}",
            self.topology_id,
            self.cache_name,
            coordinator
        );
        let message = ControlMessage::new(
            self.transport.local_node().clone(),
            view.view_id,
            ControlCommand::RebalanceConfirm {
                cache_name: self.cache_name,
                topology_id: self.topology_id,
                error,
            },
        );
        self.transport.send(&coordinator, message).await
    }
}

impl std::fmt::Debug for PhaseConfirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseConfirmation")
            .field("cache_name", &self.cache_name)
            .field("topology_id", &self.topology_id)
            .finish()
    }
}

/// What a member knows about one cache it runs
pub struct LocalCacheStatus {
    pub(crate) join_info: CacheJoinInfo,
    pub(crate) handler: Arc<dyn CacheTopologyHandler>,
    pub(crate) current_topology: Option<CacheTopology>,
    pub(crate) stable_topology: Option<CacheTopology>,
    pub(crate) availability_mode: AvailabilityMode,
}

impl LocalCacheStatus {
    pub fn new(join_info: CacheJoinInfo, handler: Arc<dyn CacheTopologyHandler>) -> Self {
        Self {
            join_info,
            handler,
            current_topology: None,
            stable_topology: None,
            availability_mode: AvailabilityMode::Available,
        }
    }

    pub fn join_info(&self) -> &CacheJoinInfo {
        &self.join_info
    }

    pub fn current_topology(&self) -> Option<&CacheTopology> {
        self.current_topology.as_ref()
    }

    pub fn stable_topology(&self) -> Option<&CacheTopology> {
        self.stable_topology.as_ref()
    }

    pub fn availability_mode(&self) -> AvailabilityMode {
        self.availability_mode
    }

    /// Id of the last applied topology, 0 before the first one
    pub fn last_topology_id(&self) -> TopologyId {
        self.current_topology
            .as_ref()
            .map_or(0, |topology| topology.topology_id)
    }

    pub fn status_response(&self) -> CacheStatusResponse {
        CacheStatusResponse {
            join_info: self.join_info.clone(),
            current_topology: self.current_topology.clone(),
            stable_topology: self.stable_topology.clone(),
            availability_mode: self.availability_mode,
        }
    }
}

/// Record `topology`'s current ownership in persistent identities
pub fn persistent_state_of(cache_name: &str, topology: &CacheTopology) -> Result<ScopedPersistentState> {
    let ownership = topology
        .current_ch
        .remap(|member| topology.persistent_id_of(member))
        .ok_or_else(|| {
            TopologyError::Internal(format!(
                "topology {} of cache {} has owners without a persistent id",
                topology.topology_id, cache_name
            ))
        })?;
    ScopedPersistentState::new(cache_name, topology.topology_id, ownership)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ConsistentHash, NodeId, PersistentId, Phase};

    fn topology(persistent_ids: Vec<PersistentId>) -> CacheTopology {
        let members = vec![NodeId::from("a"), NodeId::from("b")];
        let ch = ConsistentHash::new(
            1,
            members.clone(),
            vec![1.0, 1.0],
            vec![vec![NodeId::from("a")], vec![NodeId::from("b")]],
        );
        CacheTopology::new(7, 2, ch, None, Phase::NoRebalance, members, persistent_ids)
    }

    #[test]
    fn test_persistent_state_uses_persistent_ids() {
        let ids = vec![PersistentId::from_u128(10), PersistentId::from_u128(20)];
        let state = persistent_state_of("users", &topology(ids.clone())).unwrap();
        assert_eq!(state.topology_id, 7);
        assert_eq!(state.members(), ids.as_slice());
        assert_eq!(state.consistent_hash.segment_owners(1), &ids[1..]);
    }

    #[test]
    fn test_persistent_state_requires_every_owner_id() {
        let ids = vec![PersistentId::from_u128(10)];
        assert!(persistent_state_of("users", &topology(ids)).is_err());
    }
}
