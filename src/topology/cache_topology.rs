//! Versioned cache topology and the values exchanged around it

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::consistent_hash::{ConsistentHash, ConsistentHashFactory};
use super::{NodeId, PersistentId, RebalanceId, TopologyId};

/// Sub-state of a cache topology governing read and write ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Stable, only the current ownership is used
    NoRebalance,
    /// Two-phase rebalance: pending ownership installed, data moving
    Transitory,
    /// Four-phase rebalance, first phase
    ReadOldWriteAll,
    /// Four-phase rebalance, second phase
    ReadAllWriteAll,
    /// Four-phase rebalance, last phase
    ReadNewWriteAll,
    /// Post-merge conflict resolution
    ConflictResolution,
}

impl Phase {
    pub fn is_rebalance(&self) -> bool {
        matches!(
            self,
            Phase::Transitory
                | Phase::ReadOldWriteAll
                | Phase::ReadAllWriteAll
                | Phase::ReadNewWriteAll
        )
    }

    /// Phases members confirm as soon as they have installed them
    pub fn confirms_on_install(&self) -> bool {
        matches!(self, Phase::ReadAllWriteAll | Phase::ReadNewWriteAll)
    }
}

/// Whether a cache serves all operations or is restricted after a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityMode {
    Available,
    DegradedMode,
}

impl AvailabilityMode {
    /// Moving to this mode narrows what the cache may serve
    pub fn is_restrictive(&self) -> bool {
        *self == AvailabilityMode::DegradedMode
    }
}

impl Default for AvailabilityMode {
    fn default() -> Self {
        AvailabilityMode::Available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    Distributed,
    Replicated,
    Scattered,
}

/// Behaviour of a cache when the cluster splits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionHandling {
    DenyReadWrites,
    AllowReads,
    AllowReadWrites,
}

/// Parameters a member announces when joining a cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheJoinInfo {
    pub cache_mode: CacheMode,
    pub num_segments: usize,
    pub num_owners: usize,
    pub capacity_factor: f32,
    /// Join timeout in milliseconds
    pub timeout_ms: u64,
    pub partition_handling: PartitionHandling,
    pub resolve_conflicts_on_merge: bool,
    pub persistent_id: PersistentId,
    /// Checksum of the state persisted by this node, if any
    pub persistent_state_checksum: Option<String>,
}

impl CacheJoinInfo {
    pub fn new(cache_mode: CacheMode, num_segments: usize, num_owners: usize, persistent_id: PersistentId) -> Self {
        Self {
            cache_mode,
            num_segments,
            num_owners,
            capacity_factor: 1.0,
            timeout_ms: 10_000,
            partition_handling: PartitionHandling::AllowReadWrites,
            resolve_conflicts_on_merge: true,
            persistent_id,
            persistent_state_checksum: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One ownership generation of a cache.
///
/// Immutable once built: every change produces a new value with a higher
/// `topology_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTopology {
    pub topology_id: TopologyId,
    pub rebalance_id: RebalanceId,
    pub current_ch: ConsistentHash,
    pub pending_ch: Option<ConsistentHash>,
    /// Computed by each member, never sent over the wire
    #[serde(skip)]
    pub union_ch: Option<ConsistentHash>,
    pub phase: Phase,
    /// Members admitted to the cache when this topology was built
    pub actual_members: Vec<NodeId>,
    /// Parallel to `actual_members`
    pub persistent_ids: Vec<PersistentId>,
}

impl PartialEq for CacheTopology {
    fn eq(&self, other: &Self) -> bool {
        self.topology_id == other.topology_id
            && self.rebalance_id == other.rebalance_id
            && self.current_ch == other.current_ch
            && self.pending_ch == other.pending_ch
            && self.phase == other.phase
            && self.actual_members == other.actual_members
            && self.persistent_ids == other.persistent_ids
    }
}

impl CacheTopology {
    pub fn new(
        topology_id: TopologyId,
        rebalance_id: RebalanceId,
        current_ch: ConsistentHash,
        pending_ch: Option<ConsistentHash>,
        phase: Phase,
        actual_members: Vec<NodeId>,
        persistent_ids: Vec<PersistentId>,
    ) -> Self {
        Self {
            topology_id,
            rebalance_id,
            current_ch,
            pending_ch,
            union_ch: None,
            phase,
            actual_members,
            persistent_ids,
        }
    }

    /// Nodes the ownership sets are defined over: current members followed
    /// by members that only appear in the pending ownership
    pub fn members(&self) -> Vec<NodeId> {
        let mut members = self.current_ch.members().to_vec();
        if let Some(pending) = &self.pending_ch {
            for member in pending.members() {
                if !members.contains(member) {
                    members.push(member.clone());
                }
            }
        }
        members
    }

    pub fn is_rebalance_in_progress(&self) -> bool {
        self.pending_ch.is_some()
    }

    pub fn persistent_id_of(&self, member: &NodeId) -> Option<PersistentId> {
        self.actual_members
            .iter()
            .position(|m| m == member)
            .and_then(|index| self.persistent_ids.get(index).copied())
    }

    /// Attach the union ownership used for dual routing.
    ///
    /// During `ReadNewWriteAll` reads go through the new owners first.
    pub fn with_union(mut self, factory: &dyn ConsistentHashFactory) -> Self {
        self.union_ch = self.pending_ch.as_ref().map(|pending| {
            if self.phase == Phase::ReadNewWriteAll {
                factory.union(pending, &self.current_ch)
            } else {
                factory.union(&self.current_ch, pending)
            }
        });
        self
    }

    /// Ownership used for reads in the current phase
    pub fn read_consistent_hash(&self) -> &ConsistentHash {
        match self.phase {
            Phase::NoRebalance | Phase::ConflictResolution | Phase::ReadOldWriteAll => {
                &self.current_ch
            }
            Phase::ReadAllWriteAll => self.union_ch.as_ref().unwrap_or(&self.current_ch),
            Phase::Transitory | Phase::ReadNewWriteAll => {
                self.pending_ch.as_ref().unwrap_or(&self.current_ch)
            }
        }
    }

    /// Ownership used for writes in the current phase
    pub fn write_consistent_hash(&self) -> &ConsistentHash {
        self.union_ch
            .as_ref()
            .or(self.pending_ch.as_ref())
            .unwrap_or(&self.current_ch)
    }

    /// Drop the pending ownership, keeping whatever members currently read from
    pub fn cancel_rebalance(&self, topology_id: TopologyId, rebalance_id: RebalanceId) -> Self {
        let current_ch = match (&self.pending_ch, self.phase) {
            (Some(pending), Phase::ReadNewWriteAll) | (Some(pending), Phase::Transitory) => {
                pending.clone()
            }
            _ => self.current_ch.clone(),
        };
        let (actual_members, persistent_ids) = retain_members(
            &self.actual_members,
            &self.persistent_ids,
            current_ch.members(),
        );
        CacheTopology::new(
            topology_id,
            rebalance_id,
            current_ch,
            None,
            Phase::NoRebalance,
            actual_members,
            persistent_ids,
        )
    }

    /// Copy of this topology restricted to members of `keep`
    pub fn with_actual_members(&self, keep: &[NodeId]) -> Self {
        let (actual_members, persistent_ids) =
            retain_members(&self.actual_members, &self.persistent_ids, keep);
        CacheTopology {
            actual_members,
            persistent_ids,
            ..self.clone()
        }
    }
}

fn retain_members(
    members: &[NodeId],
    persistent_ids: &[PersistentId],
    keep: &[NodeId],
) -> (Vec<NodeId>, Vec<PersistentId>) {
    members
        .iter()
        .zip(persistent_ids)
        .filter(|(member, _)| keep.contains(member))
        .map(|(member, id)| (member.clone(), *id))
        .unzip()
}

/// Per-cache status exchanged during join and cluster recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatusResponse {
    pub join_info: CacheJoinInfo,
    pub current_topology: Option<CacheTopology>,
    pub stable_topology: Option<CacheTopology>,
    pub availability_mode: AvailabilityMode,
}

/// A member's answer to a cluster-wide status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStatusResponse {
    pub caches: HashMap<String, CacheStatusResponse>,
    pub rebalancing_enabled: bool,
}
