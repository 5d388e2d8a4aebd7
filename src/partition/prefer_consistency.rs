//! Enter degraded mode instead of serving possibly inconsistent data

use std::collections::HashMap;

use super::{
    compute_partitions, merged_topology, preferred_partition, AvailabilityStrategy,
    AvailabilityStrategyContext, LostDataCheck,
};
use crate::topology::{AvailabilityMode, CacheStatusResponse, NodeId};

/// A cache that lost every owner of some segment, or that is left with a
/// minority of its stable members, becomes degraded. It leaves degraded mode
/// only when a merge brings back all stable members or an administrator
/// overrides the mode.
#[derive(Debug)]
pub struct PreferConsistencyStrategy {
    lost_data_check: LostDataCheck,
}

impl PreferConsistencyStrategy {
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

    fn is_degraded(context: &dyn AvailabilityStrategyContext) -> bool {
        context.availability_mode() == AvailabilityMode::DegradedMode
    }
}

impl AvailabilityStrategy for PreferConsistencyStrategy {
    fn on_join(&self, context: &mut dyn AvailabilityStrategyContext, joiner: &NodeId) {
        if Self::is_degraded(context) {
            tracing::debug!(
                "Cache {} is degraded, {} waits for the partition to heal",
                context.cache_name(),
                joiner
            );
            return;
        }
        let expected = context.expected_members();
        context.queue_rebalance(expected);
    }

    fn on_graceful_leave(&self, context: &mut dyn AvailabilityStrategyContext, leaver: &NodeId) {
        if Self::is_degraded(context) {
            let expected = context.expected_members();
            tracing::debug!(
                "{} left degraded cache {}, keeping ownership",
                leaver,
                context.cache_name()
            );
            context.update_availability_mode(&expected, AvailabilityMode::DegradedMode, false);
            return;
        }
        self.prune_and_rebalance(context);
    }

    fn on_cluster_view_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        cluster_members: &[NodeId],
    ) {
        let expected = context.expected_members();
        if Self::is_degraded(context) {
            context.update_availability_mode(&expected, AvailabilityMode::DegradedMode, true);
            return;
        }

        let Some(stable) = context.stable_topology() else {
            self.prune_and_rebalance(context);
            return;
        };
        let stable_members = stable.actual_members.clone();
        let lost: Vec<NodeId> = stable_members
            .iter()
            .filter(|member| !cluster_members.contains(member))
            .cloned()
            .collect();
        if lost.is_empty() {
            self.prune_and_rebalance(context);
            return;
        }

        let data_lost = self
            .lost_data_check
            .is_data_lost(&stable.current_ch, cluster_members);
        let minority = lost.len() * 2 >= stable_members.len();
        if data_lost || minority {
            tracing::warn!(
                "Cache {} entering degraded mode: lost {:?} of {:?} (data lost: {}, minority: {})",
                context.cache_name(),
                lost,
                stable_members,
                data_lost,
                minority
            );
            context.update_availability_mode(&expected, AvailabilityMode::DegradedMode, true);
            return;
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

        let available = partitions
            .iter()
            .filter(|p| p.availability_mode == AvailabilityMode::Available);
        let Some(preferred) = preferred_partition(available).or_else(|| preferred_partition(&partitions)) else {
            context.update_current_topology(&expected);
            context.queue_rebalance(expected);
            return;
        };

        // Degraded partitions can only heal once every member of the latest
        // stable topology is back.
        let mut mode = AvailabilityMode::Available;
        if partitions
            .iter()
            .all(|p| p.availability_mode == AvailabilityMode::DegradedMode)
        {
            let latest_stable = partitions
                .iter()
                .filter_map(|p| p.stable_topology.as_ref())
                .max_by_key(|stable| stable.topology_id);
            let complete = latest_stable.map_or(true, |stable| {
                stable
                    .actual_members
                    .iter()
                    .all(|member| expected.contains(member))
            });
            if !complete {
                mode = AvailabilityMode::DegradedMode;
            }
        }

        let resolve_conflicts = mode == AvailabilityMode::Available
            && context.resolve_conflicts_on_merge()
            && partitions.len() > 1;
        let factory = context.consistent_hash_factory();
        let merged = merged_topology(
            factory.as_ref(),
            &partitions,
            preferred,
            &expected,
            statuses,
            resolve_conflicts,
        );
        let needs_prune = !resolve_conflicts
            && merged
                .members()
                .iter()
                .any(|member| !expected.contains(member));

        context.update_topologies_after_merge(
            Some(merged),
            preferred.stable_topology.clone(),
            mode,
            resolve_conflicts,
        );
        if mode == AvailabilityMode::DegradedMode {
            tracing::info!(
                "Cache {} stays degraded after merge, waiting for missing members",
                context.cache_name()
            );
            return;
        }
        if needs_prune {
            context.update_current_topology(&expected);
        }
        context.queue_rebalance(expected);
    }

    fn on_rebalance_end(&self, context: &mut dyn AvailabilityStrategyContext) {
        if !Self::is_degraded(context) {
            context.update_stable_topology();
        }
    }

    fn on_manual_availability_change(
        &self,
        context: &mut dyn AvailabilityStrategyContext,
        mode: AvailabilityMode,
    ) {
        let expected = context.expected_members();
        context.update_availability_mode(&expected, mode, false);
        if mode == AvailabilityMode::Available {
            self.prune_and_rebalance(context);
        }
    }
}
