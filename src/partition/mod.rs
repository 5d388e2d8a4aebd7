//! Partition handling
//!
//! The coordinator delegates every membership-driven decision of a cache to
//! an `AvailabilityStrategy`: what to do when members join, leave or vanish,
//! how to rebuild the cache state after partitions merge, and when a
//! finished rebalance becomes the stable topology. The strategy acts through
//! the `AvailabilityStrategyContext` implemented by the per-cache state.

pub mod prefer_availability;
pub mod prefer_consistency;

pub use prefer_availability::PreferAvailabilityStrategy;
pub use prefer_consistency::PreferConsistencyStrategy;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheMode, CacheStatusResponse, CacheTopology,
    ConsistentHash, ConsistentHashFactory, NodeId, PartitionHandling, PersistentId, Phase,
    RebalanceId, TopologyId,
};

/// Operations a strategy may perform on a cache's coordinator state
pub trait AvailabilityStrategyContext {
    fn cache_name(&self) -> &str;
    fn join_info(&self) -> Option<&CacheJoinInfo>;
    fn expected_members(&self) -> Vec<NodeId>;
    fn current_topology(&self) -> Option<&CacheTopology>;
    fn stable_topology(&self) -> Option<&CacheTopology>;
    fn availability_mode(&self) -> AvailabilityMode;
    fn consistent_hash_factory(&self) -> Arc<dyn ConsistentHashFactory>;

    fn resolve_conflicts_on_merge(&self) -> bool {
        self.join_info()
            .map(|info| info.resolve_conflicts_on_merge)
            .unwrap_or(false)
    }

    /// Request a rebalance towards `members`
    fn queue_rebalance(&mut self, members: Vec<NodeId>);

    /// Install a topology restricted to `members` (or the initial topology
    /// when the cache has none yet)
    fn update_current_topology(&mut self, members: &[NodeId]);

    /// Install a topology with new actual members and availability mode
    fn update_availability_mode(
        &mut self,
        actual_members: &[NodeId],
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    );

    /// Install the outcome of a partition merge
    fn update_topologies_after_merge(
        &mut self,
        current: Option<CacheTopology>,
        stable: Option<CacheTopology>,
        mode: AvailabilityMode,
        resolve_conflicts: bool,
    );

    /// Record the current topology as the stable one and broadcast it
    fn update_stable_topology(&mut self);
}

/// Pluggable partition-availability policy
pub trait AvailabilityStrategy: Send + Sync + Debug {
    fn on_join(&self, context: &mut dyn AvailabilityStrategyContext, joiner: &NodeId);

    fn on_graceful_leave(&self, context: &mut dyn AvailabilityStrategyContext, leaver: &NodeId);

    /// Called after the context pruned its expected members to `cluster_members`
    fn on_cluster_view_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        cluster_members: &[NodeId],
    );

    /// Rebuild the cache state from every member's report after a
    /// coordinator change or a merge
    fn on_partition_merge(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        statuses: &HashMap<NodeId, CacheStatusResponse>,
    );

    fn on_rebalance_end(&self, context: &mut dyn AvailabilityStrategyContext);

    fn on_manual_availability_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        mode: AvailabilityMode,
    );
}

/// Pick the strategy matching the cache's partition handling
pub fn strategy_for(join_info: &CacheJoinInfo) -> Arc<dyn AvailabilityStrategy> {
    let lost_data_check = LostDataCheck::for_cache_mode(join_info.cache_mode);
    match join_info.partition_handling {
        PartitionHandling::AllowReadWrites => {
            Arc::new(PreferAvailabilityStrategy::new(lost_data_check))
        }
        PartitionHandling::AllowReads | PartitionHandling::DenyReadWrites => {
            Arc::new(PreferConsistencyStrategy::new(lost_data_check))
        }
    }
}

/// Decides whether losing members lost every copy of some data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostDataCheck {
    /// Data is lost when every owner of some segment is gone
    Distributed,
    /// Data is lost when more than one owner is gone
    Scattered,
}

impl LostDataCheck {
    pub fn for_cache_mode(cache_mode: CacheMode) -> Self {
        match cache_mode {
            CacheMode::Scattered => LostDataCheck::Scattered,
            CacheMode::Distributed | CacheMode::Replicated => LostDataCheck::Distributed,
        }
    }

    pub fn is_data_lost(&self, ch: &ConsistentHash, remaining: &[NodeId]) -> bool {
        match self {
            LostDataCheck::Distributed => (0..ch.num_segments()).any(|segment| {
                let owners = ch.segment_owners(segment);
                !owners.is_empty() && owners.iter().all(|owner| !remaining.contains(owner))
            }),
            LostDataCheck::Scattered => {
                ch.members()
                    .iter()
                    .filter(|member| !remaining.contains(member))
                    .count()
                    > 1
            }
        }
    }
}

/// Group of members that reported the same lineage of topologies
#[derive(Debug, Clone)]
pub struct Partition {
    pub topology: CacheTopology,
    pub stable_topology: Option<CacheTopology>,
    pub availability_mode: AvailabilityMode,
    pub senders: Vec<NodeId>,
}

impl Partition {
    pub fn read_consistent_hash(&self) -> &ConsistentHash {
        self.topology.read_consistent_hash()
    }
}

/// Group status reports into partitions.
///
/// Reports without a topology, or from a sender missing from its own
/// topology, are ignored. A partition is dropped as stale when another
/// partition already derived a newer stable topology from it and all of its
/// members are part of the merge.
pub fn compute_partitions(
    statuses: &HashMap<NodeId, CacheStatusResponse>,
    merge_members: &[NodeId],
) -> Vec<Partition> {
    let mut reports: Vec<(&NodeId, &CacheStatusResponse, &CacheTopology)> = statuses
        .iter()
        .filter_map(|(sender, status)| {
            let topology = status.current_topology.as_ref()?;
            if !topology.actual_members.contains(sender) {
                tracing::debug!(
                    "Ignoring topology {} from {}: sender is not one of its members",
                    topology.topology_id,
                    sender
                );
                return None;
            }
            Some((sender, status, topology))
        })
        .collect();
    reports.sort_by(|a, b| {
        b.2.topology_id
            .cmp(&a.2.topology_id)
            .then_with(|| a.0.cmp(b.0))
    });

    let mut partitions: Vec<Partition> = Vec::new();
    for (sender, status, topology) in reports {
        if let Some(partition) = partitions
            .iter_mut()
            .find(|p| p.topology.actual_members.contains(sender))
        {
            partition.senders.push(sender.clone());
            continue;
        }
        partitions.push(Partition {
            topology: topology.clone(),
            stable_topology: status.stable_topology.clone(),
            availability_mode: status.availability_mode,
            senders: vec![sender.clone()],
        });
    }

    let is_stale = |index: usize, partition: &Partition| {
        partitions.iter().enumerate().any(|(other_index, other)| {
            other_index != index
                && partition.topology.topology_id < other.topology.topology_id
                && other
                    .stable_topology
                    .as_ref()
                    .map_or(false, |stable| partition.topology.topology_id <= stable.topology_id)
                && partition
                    .topology
                    .actual_members
                    .iter()
                    .all(|member| merge_members.contains(member))
        })
    };
    let stale: Vec<bool> = partitions
        .iter()
        .enumerate()
        .map(|(index, partition)| is_stale(index, partition))
        .collect();

    partitions
        .into_iter()
        .zip(stale)
        .filter_map(|(partition, stale)| {
            if stale {
                tracing::debug!(
                    "Dropping stale partition with topology {} reported by {:?}",
                    partition.topology.topology_id,
                    partition.senders
                );
                None
            } else {
                Some(partition)
            }
        })
        .collect()
}

/// The partition with the most members, then the highest topology id
pub fn preferred_partition<'a, I>(partitions: I) -> Option<&'a Partition>
where
    I: IntoIterator<Item = &'a Partition>,
{
    partitions.into_iter().max_by(|a, b| {
        a.topology
            .actual_members
            .len()
            .cmp(&b.topology.actual_members.len())
            .then_with(|| a.topology.topology_id.cmp(&b.topology.topology_id))
    })
}

/// Highest topology and rebalance ids seen in any report, current or stable
pub fn max_ids(statuses: &HashMap<NodeId, CacheStatusResponse>) -> (TopologyId, RebalanceId) {
    statuses
        .values()
        .flat_map(|status| {
            status
                .current_topology
                .iter()
                .chain(status.stable_topology.iter())
        })
        .fold((0, 0), |(topology_id, rebalance_id), t| {
            (
                topology_id.max(t.topology_id),
                rebalance_id.max(t.rebalance_id),
            )
        })
}

/// Build the topology installed after a merge.
///
/// With conflict resolution the ownership is the union of every partition's
/// read ownership, preferred partition first; otherwise the preferred
/// partition's rebalance is cancelled.
pub fn merged_topology(
    factory: &dyn ConsistentHashFactory,
    partitions: &[Partition],
    preferred: &Partition,
    merge_members: &[NodeId],
    statuses: &HashMap<NodeId, CacheStatusResponse>,
    resolve_conflicts: bool,
) -> CacheTopology {
    let (max_topology_id, max_rebalance_id) = max_ids(statuses);
    let topology_id = max_topology_id + 1;
    let rebalance_id = max_rebalance_id + 1;

    if !resolve_conflicts {
        return preferred
            .topology
            .cancel_rebalance(topology_id, rebalance_id)
            .with_actual_members(merge_members);
    }

    let mut conflict_ch = preferred.read_consistent_hash().clone();
    let mut actual_members: Vec<NodeId> = Vec::new();
    let mut persistent_ids: Vec<PersistentId> = Vec::new();
    let others = partitions.iter().filter(|p| !std::ptr::eq(*p, preferred));
    for partition in std::iter::once(preferred).chain(others) {
        if !std::ptr::eq(partition, preferred) {
            conflict_ch = factory.union(&conflict_ch, partition.read_consistent_hash());
        }
        for (member, persistent_id) in partition
            .topology
            .actual_members
            .iter()
            .zip(&partition.topology.persistent_ids)
        {
            if merge_members.contains(member) && !actual_members.contains(member) {
                actual_members.push(member.clone());
                persistent_ids.push(*persistent_id);
            }
        }
    }

    CacheTopology::new(
        topology_id,
        rebalance_id,
        conflict_ch,
        None,
        Phase::ConflictResolution,
        actual_members,
        persistent_ids,
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory context recording what a strategy asked for

    use super::*;
    use crate::topology::RingConsistentHashFactory;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        QueueRebalance(Vec<NodeId>),
        UpdateCurrentTopology(Vec<NodeId>),
        UpdateAvailabilityMode(Vec<NodeId>, AvailabilityMode, bool),
        UpdateTopologiesAfterMerge(Option<CacheTopology>, Option<CacheTopology>, AvailabilityMode, bool),
        UpdateStableTopology,
    }

    pub struct RecordingContext {
        pub join_info: CacheJoinInfo,
        pub expected: Vec<NodeId>,
        pub current: Option<CacheTopology>,
        pub stable: Option<CacheTopology>,
        pub mode: AvailabilityMode,
        pub factory: Arc<dyn ConsistentHashFactory>,
        pub calls: Vec<Call>,
    }

    impl RecordingContext {
        pub fn new(join_info: CacheJoinInfo, expected: Vec<NodeId>) -> Self {
            Self {
                join_info,
                expected,
                current: None,
                stable: None,
                mode: AvailabilityMode::Available,
                factory: Arc::new(RingConsistentHashFactory::default()),
                calls: Vec::new(),
            }
        }
    }

    impl AvailabilityStrategyContext for RecordingContext {
        fn cache_name(&self) -> &str {
            "test-cache"
        }
        fn join_info(&self) -> Option<&CacheJoinInfo> {
            Some(&self.join_info)
        }
        fn expected_members(&self) -> Vec<NodeId> {
            self.expected.clone()
        }
        fn current_topology(&self) -> Option<&CacheTopology> {
            self.current.as_ref()
        }
        fn stable_topology(&self) -> Option<&CacheTopology> {
            self.stable.as_ref()
        }
        fn availability_mode(&self) -> AvailabilityMode {
            self.mode
        }
        fn consistent_hash_factory(&self) -> Arc<dyn ConsistentHashFactory> {
            Arc::clone(&self.factory)
        }
        fn queue_rebalance(&mut self, members: Vec<NodeId>) {
            self.calls.push(Call::QueueRebalance(members));
        }
        fn update_current_topology(&mut self, members: &[NodeId]) {
            self.calls.push(Call::UpdateCurrentTopology(members.to_vec()));
        }
        fn update_availability_mode(&mut self, actual_members: &[NodeId], mode: AvailabilityMode, cancel_rebalance: bool) {
            self.mode = mode;
            self.calls.push(Call::UpdateAvailabilityMode(actual_members.to_vec(), mode, cancel_rebalance));
        }
        fn update_topologies_after_merge(
            &mut self,
            current: Option<CacheTopology>,
            stable: Option<CacheTopology>,
            mode: AvailabilityMode,
            resolve_conflicts: bool,
        ) {
            self.calls.push(Call::UpdateTopologiesAfterMerge(current, stable, mode, resolve_conflicts));
        }
        fn update_stable_topology(&mut self) {
            self.calls.push(Call::UpdateStableTopology);
        }
    }

    pub fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::from(*id)).collect()
    }

    pub fn pid(node: &NodeId) -> PersistentId {
        PersistentId::from_u128(node.as_str().bytes().map(u128::from).sum())
    }

    /// Stable topology over `members` with the given ids
    pub fn stable_topology(topology_id: TopologyId, members: &[NodeId]) -> CacheTopology {
        let factory = RingConsistentHashFactory::default();
        let ch = factory.create(2, 16, members, &HashMap::new());
        CacheTopology::new(
            topology_id,
            1,
            ch,
            None,
            Phase::NoRebalance,
            members.to_vec(),
            members.iter().map(pid).collect(),
        )
    }

    /// Same lineage without `removed`, one topology later
    pub fn without(topology: &CacheTopology, removed: &[NodeId]) -> CacheTopology {
        let factory = RingConsistentHashFactory::default();
        let keep: Vec<NodeId> = topology
            .actual_members
            .iter()
            .filter(|m| !removed.contains(m))
            .cloned()
            .collect();
        let current = factory.update_members(&topology.current_ch, &keep, &HashMap::new());
        CacheTopology::new(
            topology.topology_id + 1,
            topology.rebalance_id,
            current,
            None,
            Phase::NoRebalance,
            keep.clone(),
            keep.iter().map(pid).collect(),
        )
    }

    pub fn status(
        join_info: &CacheJoinInfo,
        current: Option<CacheTopology>,
        stable: Option<CacheTopology>,
    ) -> CacheStatusResponse {
        CacheStatusResponse {
            join_info: join_info.clone(),
            current_topology: current,
            stable_topology: stable,
            availability_mode: AvailabilityMode::Available,
        }
    }
}
