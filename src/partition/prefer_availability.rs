//! Keep serving in every partition; reconcile on merge

use std::collections::HashMap;

use super::{
    compute_partitions, merged_topology, preferred_partition, AvailabilityStrategy,
    AvailabilityStrategyContext, LostDataCheck,
};
use crate::topology::{AvailabilityMode, CacheStatusResponse, NodeId};

/// Every partition stays available. On merge the largest partition wins and,
/// when the cache asks for it, conflicting copies are resolved before the
/// next rebalance.
#[derive(Debug)]
pub struct PreferAvailabilityStrategy {
    lost_data_check: LostDataCheck,
}

impl PreferAvailabilityStrategy {
    pub fn new(lost_data_check: LostDataCheck) -> Self {
        Self { lost_data_check }
    }

    fn prune_and_rebalance(&self, context: &mut dyn AvailabilityStrategyContext) {
        let expected = context.expected_members();
        let has_departed_owners = context
            .current_topology()
            .map(|topology| topology.members().iter().any(|m| !expected.contains(m)))
            .unwrap_or(false);
        if has_departed_owners {
            context.update_current_topology(&expected);
        }
        context.queue_rebalance(expected);
    }
}

impl AvailabilityStrategy for PreferAvailabilityStrategy {
    fn on_join(&self, context: &mut dyn AvailabilityStrategyContext, _joiner: &NodeId) {
        let expected = context.expected_members();
        context.queue_rebalance(expected);
    }

    fn on_graceful_leave(&self, context: &mut dyn AvailabilityStrategyContext, leaver: &NodeId) {
        tracing::debug!("{} left cache {} gracefully", leaver, context.cache_name());
        self.prune_and_rebalance(context);
    }

    fn on_cluster_view_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        cluster_members: &[NodeId],
    ) {
        if let Some(stable) = context.stable_topology() {
            if self
                .lost_data_check
                .is_data_lost(&stable.current_ch, cluster_members)
            {
                tracing::warn!(
                    "Cache {} lost all owners of some segments, continuing with remaining members",
                    context.cache_name()
                );
            }
        }
        self.prune_and_rebalance(context);
    }

    fn on_partition_merge(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        statuses: &HashMap<NodeId, CacheStatusResponse>,
    ) {
        let expected = context.expected_members();
        let partitions = compute_partitions(statuses, &expected);

        let Some(preferred) = preferred_partition(&partitions) else {
            // Only joiners reported, the cache gets its first topology.
            context.update_current_topology(&expected);
            context.queue_rebalance(expected);
            return;
        };

        let resolve_conflicts = context.resolve_conflicts_on_merge() && partitions.len() > 1;
        let factory = context.consistent_hash_factory();
        let merged = merged_topology(
            factory.as_ref(),
            &partitions,
            preferred,
            &expected,
            statuses,
            resolve_conflicts,
        );
        tracing::info!(
            "Merging {} partition(s) of cache {} into topology {} (conflict resolution: {})",
            partitions.len(),
            context.cache_name(),
            merged.topology_id,
            resolve_conflicts
        );

        let needs_prune = !resolve_conflicts
            && merged
                .members()
                .iter()
                .any(|member| !expected.contains(member));
        context.update_topologies_after_merge(
            Some(merged),
            preferred.stable_topology.clone(),
            AvailabilityMode::Available,
            resolve_conflicts,
        );
        if needs_prune {
            context.update_current_topology(&expected);
        }
        context.queue_rebalance(expected);
    }

    fn on_rebalance_end(&self, context: &mut dyn AvailabilityStrategyContext) {
        context.update_stable_topology();
    }

    fn on_manual_availability_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        mode: AvailabilityMode,
    ) {
        let expected = context.expected_members();
        context.update_availability_mode(&expected, mode, false);
    }
}
