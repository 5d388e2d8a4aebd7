//! Coordinator-side state of one cache
//!
//! `ClusterCacheStatus` owns the authoritative topology of a cache and runs
//! its rebalance state machine. Every method is synchronous: the caller holds
//! the per-cache lock, and the side effects a transition produces (broadcasts,
//! conflict resolution) are queued as `CacheAction`s and executed by the
//! coordinator service before the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::state_store::PersistentStateStore;
use crate::error::{Result, TopologyError};
use crate::events::{ClusterEventKind, ClusterEventLog};
use crate::log::log_topology_update;
use crate::metrics::TopologyMetrics;
use crate::partition::{strategy_for, AvailabilityStrategy, AvailabilityStrategyContext};
use crate::protocol::{ControlCommand, TopologyUpdateKind};
use crate::rebalancing::{RebalanceConfirmationCollector, RebalanceType};
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ConsistentHash,
    ConsistentHashFactory, NodeId, PersistentId, PersistentIdentityManager, Phase, RebalanceId,
    ScopedPersistentState, TopologyId,
};

/// Side effect of a state transition, executed outside the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CacheAction {
    /// Send to every member of the current view
    Broadcast(ControlCommand),
    /// Run the conflict resolver against this topology
    ResolveConflicts(CacheTopology),
}

/// Node-wide services shared by every cache status
#[derive(Clone)]
pub struct CacheStatusServices {
    pub factory: Arc<dyn ConsistentHashFactory>,
    pub identity: Arc<PersistentIdentityManager>,
    pub state_store: Arc<dyn PersistentStateStore>,
    pub events: Arc<ClusterEventLog>,
    pub metrics: Arc<TopologyMetrics>,
    /// Cluster-wide rebalancing switch
    pub global_rebalancing: Arc<AtomicBool>,
}

pub struct ClusterCacheStatus {
    cache_name: String,
    join_info: CacheJoinInfo,
    strategy: Arc<dyn AvailabilityStrategy>,
    rebalance_type: RebalanceType,
    services: CacheStatusServices,

    expected_members: Vec<NodeId>,
    capacity_factors: HashMap<NodeId, f32>,
    joiners: Vec<NodeId>,
    current_topology: Option<CacheTopology>,
    stable_topology: Option<CacheTopology>,
    availability_mode: AvailabilityMode,
    rebalancing_enabled: bool,

    queued_rebalance_members: Option<Vec<NodeId>>,
    collector: Option<RebalanceConfirmationCollector>,
    /// Topology id of the running conflict resolution
    conflict_resolution: Option<TopologyId>,
    /// Ownership recorded before a cluster restart, until it is restored
    persisted_state: Option<ScopedPersistentState>,

    last_topology_id: TopologyId,
    last_rebalance_id: RebalanceId,
    outbox: Vec<CacheAction>,
}

impl ClusterCacheStatus {
    /// Create the state of a cache, continuing from `retired_ids` when the
    /// cache existed before.
    pub fn new(
        cache_name: impl Into<String>,
        join_info: CacheJoinInfo,
        services: CacheStatusServices,
        retired_ids: Option<(TopologyId, RebalanceId)>,
    ) -> Self {
        let cache_name = cache_name.into();
        let persisted_state = services.state_store.load(&cache_name);
        let (mut last_topology_id, last_rebalance_id) = retired_ids.unwrap_or((0, 0));
        if let Some(state) = &persisted_state {
            tracing::info!(
                "Cache {} has persisted state from topology {} with {} member(s)",
                cache_name,
                state.topology_id,
                state.members().len()
            );
            last_topology_id = last_topology_id.max(state.topology_id);
        }

        Self {
            strategy: strategy_for(&join_info),
            rebalance_type: RebalanceType::for_cache_mode(join_info.cache_mode),
            cache_name,
            join_info,
            services,
            expected_members: Vec::new(),
            capacity_factors: HashMap::new(),
            joiners: Vec::new(),
            current_topology: None,
            stable_topology: None,
            availability_mode: AvailabilityMode::Available,
            rebalancing_enabled: true,
            queued_rebalance_members: None,
            collector: None,
            conflict_resolution: None,
            persisted_state,
            last_topology_id,
            last_rebalance_id,
            outbox: Vec::new(),
        }
    }

    /// Drain the side effects queued since the last call
    pub fn take_actions(&mut self) -> Vec<CacheAction> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_empty(&self) -> bool {
        self.expected_members.is_empty()
    }

    pub fn joiners(&self) -> &[NodeId] {
        &self.joiners
    }

    /// Highest ids handed out so far, remembered when the cache is destroyed
    pub fn retired_ids(&self) -> (TopologyId, RebalanceId) {
        (self.last_topology_id, self.last_rebalance_id)
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled
    }

    pub fn is_conflict_resolution_in_progress(&self) -> bool {
        self.conflict_resolution.is_some()
    }

    /// Members the active confirmation barrier still waits for
    pub fn pending_confirmations(&self) -> Vec<NodeId> {
        self.collector
            .as_ref()
            .map(RebalanceConfirmationCollector::pending)
            .unwrap_or_default()
    }

    pub fn status_response(&self) -> CacheStatusResponse {
        CacheStatusResponse {
            join_info: self.join_info.clone(),
            current_topology: self.current_topology.clone(),
            stable_topology: self.stable_topology.clone(),
            availability_mode: self.availability_mode,
        }
    }

    /// Admit `joiner` and return the status it starts from.
    ///
    /// The returned topology is the one installed before any rebalance the
    /// join triggers; the joiner receives the rebalance as a broadcast.
    pub fn join(&mut self, joiner: &NodeId, join_info: &CacheJoinInfo) -> Result<CacheStatusResponse> {
        if let Err(e) = self.validate_join(joiner, join_info) {
            self.services.metrics.record_join(&self.cache_name, false);
            return Err(e);
        }
        if !self.admit_joiner(joiner, join_info) {
            tracing::debug!("{} is already a member of cache {}", joiner, self.cache_name);
            return Ok(self.status_response());
        }
        self.services.metrics.record_join(&self.cache_name, true);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::MemberJoined,
            format!("{} joined", joiner),
        );

        if self.current_topology.is_none() {
            if self.persisted_state.is_some() {
                self.try_restore_persisted_state();
            } else {
                let members = self.expected_members.clone();
                self.create_initial_topology(&members);
            }
            return Ok(self.status_response());
        }

        let response = self.status_response();
        let strategy = Arc::clone(&self.strategy);
        strategy.on_join(self, joiner);
        Ok(response)
    }

    fn validate_join(&self, joiner: &NodeId, join_info: &CacheJoinInfo) -> Result<()> {
        let reject = |reason: String| {
            tracing::warn!("Rejecting {} from cache {}: {}", joiner, self.cache_name, reason);
            Err(TopologyError::JoinRejected {
                cache_name: self.cache_name.clone(),
                reason,
            })
        };

        match (&self.persisted_state, &join_info.persistent_state_checksum) {
            (Some(_), None) => reject("the cache is restoring persisted state and the node has none".into()),
            (Some(state), Some(checksum)) if *checksum != state.checksum => reject(format!(
                "persisted state checksum {} does not match {}",
                checksum, state.checksum
            )),
            (None, Some(checksum)) if self.current_topology.is_none() => reject(format!(
                "the node carries persisted state {} but the cache has none",
                checksum
            )),
            _ => Ok(()),
        }
    }

    /// Record `joiner` as an expected member; false when it already was one
    pub fn admit_joiner(&mut self, joiner: &NodeId, join_info: &CacheJoinInfo) -> bool {
        self.services
            .identity
            .add_persistent_address_mapping(joiner.clone(), join_info.persistent_id);
        if self.expected_members.contains(joiner) {
            return false;
        }
        self.capacity_factors
            .insert(joiner.clone(), join_info.capacity_factor);
        self.expected_members.push(joiner.clone());
        self.joiners.push(joiner.clone());
        true
    }

    /// Forget `member`; false when it was not a member
    pub fn remove_member(&mut self, member: &NodeId) -> bool {
        let was_member = self.expected_members.contains(member);
        self.expected_members.retain(|m| m != member);
        self.joiners.retain(|m| m != member);
        self.capacity_factors.remove(member);
        was_member
    }

    /// Graceful leave of `leaver`
    pub fn leave(&mut self, leaver: &NodeId) -> bool {
        if !self.remove_member(leaver) {
            return false;
        }
        self.services.metrics.record_leave(&self.cache_name);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::MemberLeft,
            format!("{} left", leaver),
        );
        if self.is_empty() {
            return true;
        }
        if self.conflict_resolution.is_some() && self.expected_members.len() <= 1 {
            self.cancel_conflict_resolution();
        }
        let strategy = Arc::clone(&self.strategy);
        strategy.on_graceful_leave(self, leaver);
        self.update_collector_members();
        true
    }

    /// Prune members missing from `live_members`; true when membership changed
    pub fn reconcile_members(&mut self, live_members: &[NodeId]) -> bool {
        let departed: Vec<NodeId> = self
            .expected_members
            .iter()
            .filter(|m| !live_members.contains(m))
            .cloned()
            .collect();
        if departed.is_empty() {
            return false;
        }
        for member in &departed {
            self.remove_member(member);
        }
        tracing::info!(
            "Cache {} lost member(s) {:?}, expected members now {:?}",
            self.cache_name,
            departed,
            self.expected_members
        );
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::MembershipUpdated,
            format!("departed {:?}", departed),
        );
        if self.is_empty() {
            self.collector = None;
            return true;
        }

        if self.conflict_resolution.is_some() {
            if self.expected_members.len() <= 1 {
                self.cancel_conflict_resolution();
            } else {
                self.restart_conflict_resolution();
                return true;
            }
        }

        let strategy = Arc::clone(&self.strategy);
        strategy.on_cluster_view_change(self, live_members);
        self.update_collector_members();
        true
    }

    /// Rebuild this cache from the statuses reported after a coordinator
    /// change or a merge
    pub fn merge_statuses(
        &mut self,
        statuses: &HashMap<NodeId, CacheStatusResponse>,
        live_members: &[NodeId],
    ) {
        let mut reporters: Vec<&NodeId> = statuses.keys().collect();
        reporters.sort();
        for node in reporters {
            if live_members.contains(node) {
                self.admit_joiner(node, &statuses[node].join_info);
            }
        }
        let live_statuses: HashMap<NodeId, CacheStatusResponse> = statuses
            .iter()
            .filter(|(node, _)| live_members.contains(node))
            .map(|(node, status)| (node.clone(), status.clone()))
            .collect();

        let strategy = Arc::clone(&self.strategy);
        strategy.on_partition_merge(self, &live_statuses);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::PartitionMerged,
            format!(
                "merged reports of {} member(s) into topology {:?}",
                live_statuses.len(),
                self.current_topology.as_ref().map(|t| t.topology_id)
            ),
        );
    }

    /// Record `member`'s confirmation of `topology_id`
    pub fn confirm_phase(&mut self, member: &NodeId, topology_id: TopologyId) {
        if self.current_topology.is_none() {
            tracing::debug!(
                "Ignoring confirmation from {} for cache {}: no topology",
                member,
                self.cache_name
            );
            return;
        }
        let Some(collector) = self.collector.as_mut() else {
            tracing::debug!(
                "Ignoring confirmation from {} for cache {} topology {}: no rebalance in progress",
                member,
                self.cache_name,
                topology_id
            );
            return;
        };
        match collector.confirm(member, topology_id) {
            Ok(completed) => {
                self.services.metrics.record_phase_confirmation(&self.cache_name);
                if completed {
                    self.on_phase_complete();
                }
            }
            Err(e) => {
                self.services.metrics.record_stale_update(&self.cache_name);
                tracing::debug!("Ignoring confirmation from {}: {}", member, e);
            }
        }
    }

    /// Start the queued rebalance when nothing prevents it
    pub fn start_queued_rebalance(&mut self) {
        let Some(members) = self.queued_rebalance_members.clone() else {
            return;
        };
        if self.conflict_resolution.is_some() {
            tracing::debug!(
                "Postponing rebalance of cache {} until conflict resolution completes",
                self.cache_name
            );
            return;
        }
        if !self.rebalancing_allowed() {
            tracing::debug!("Rebalancing is disabled for cache {}", self.cache_name);
            return;
        }
        if self.persisted_state.is_some() {
            tracing::debug!(
                "Postponing rebalance of cache {} until persisted state is restored",
                self.cache_name
            );
            return;
        }
        let Some(current) = self.current_topology.clone() else {
            return;
        };
        if current.is_rebalance_in_progress() || current.phase == Phase::ConflictResolution {
            return;
        }
        self.queued_rebalance_members = None;
        if members.is_empty() {
            return;
        }

        let factory = Arc::clone(&self.services.factory);
        let updated = factory.update_members(&current.current_ch, &members, &self.capacity_factors);
        let balanced = factory.rebalance(&updated);
        let (actual_members, persistent_ids) = self.with_persistent_ids(&members);

        if balanced == current.current_ch {
            if current.actual_members != actual_members {
                let topology = CacheTopology {
                    topology_id: self.next_topology_id(),
                    actual_members,
                    persistent_ids,
                    ..current
                };
                self.install_topology(topology);
                self.broadcast_topology(TopologyUpdateKind::Ch);
            } else {
                tracing::debug!("Cache {} is already balanced", self.cache_name);
            }
            return;
        }

        let topology = CacheTopology::new(
            self.next_topology_id(),
            self.next_rebalance_id(),
            current.current_ch,
            Some(balanced),
            self.rebalance_type.first_phase(),
            actual_members,
            persistent_ids,
        );
        tracing::info!(
            "Starting rebalance {} of cache {} in topology {} over {:?}",
            topology.rebalance_id,
            self.cache_name,
            topology.topology_id,
            topology.actual_members
        );
        self.services.metrics.record_rebalance_started(&self.cache_name);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::RebalanceStarted,
            format!(
                "rebalance {} in topology {}",
                topology.rebalance_id, topology.topology_id
            ),
        );
        self.install_topology(topology);
        self.broadcast_rebalance_start();
        self.reset_collector();
    }

    /// Explicit rebalance request from an administrator
    pub fn force_rebalance(&mut self) -> Result<()> {
        if self.persisted_state.is_some() {
            let missing = self.missing_persisted_members();
            if !missing.is_empty() {
                return Err(TopologyError::MissingMembers {
                    cache_name: self.cache_name.clone(),
                    missing,
                });
            }
            self.try_restore_persisted_state();
            return Ok(());
        }
        let members = self.expected_members.clone();
        self.queue_rebalance(members);
        Ok(())
    }

    pub fn set_rebalancing_enabled(&mut self, enabled: bool) {
        if self.rebalancing_enabled == enabled {
            return;
        }
        tracing::info!(
            "Rebalancing {} for cache {}",
            if enabled { "enabled" } else { "disabled" },
            self.cache_name
        );
        self.rebalancing_enabled = enabled;
        if enabled {
            self.start_queued_rebalance();
        }
    }

    /// Administrative availability override
    pub fn set_availability_mode(&mut self, mode: AvailabilityMode) {
        let strategy = Arc::clone(&self.strategy);
        strategy.on_manual_availability_change(self, mode);
    }

    /// Finish the conflict resolution started for `topology_id`.
    ///
    /// A failed resolution still completes: the cache proceeds with the
    /// merged ownership.
    pub fn complete_conflict_resolution(&mut self, topology_id: TopologyId, outcome: Result<()>) {
        if self.conflict_resolution != Some(topology_id) {
            tracing::debug!(
                "Ignoring outcome of superseded conflict resolution {} for cache {}",
                topology_id,
                self.cache_name
            );
            return;
        }
        self.conflict_resolution = None;
        if let Err(e) = outcome {
            tracing::warn!("Conflict resolution failed for cache {}: {}", self.cache_name, e);
        }
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::ConflictResolutionFinished,
            format!("topology {}", topology_id),
        );
        self.leave_conflict_resolution_phase();
        self.start_queued_rebalance();
    }

    /// Ask every member to persist its state and drop the cache
    pub fn shutdown(&mut self) {
        tracing::info!("Shutting down cache {} cluster-wide", self.cache_name);
        self.collector = None;
        self.queued_rebalance_members = None;
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::CacheShutdown,
            format!("topology {:?}", self.current_topology.as_ref().map(|t| t.topology_id)),
        );
        self.outbox.push(CacheAction::Broadcast(ControlCommand::ShutdownPerform {
            cache_name: self.cache_name.clone(),
            topology: self.current_topology.clone(),
        }));
    }

    fn rebalancing_allowed(&self) -> bool {
        self.rebalancing_enabled && self.services.global_rebalancing.load(Ordering::SeqCst)
    }

    fn next_topology_id(&self) -> TopologyId {
        self.last_topology_id + 1
    }

    fn next_rebalance_id(&self) -> RebalanceId {
        self.last_rebalance_id + 1
    }

    fn install_topology(&mut self, topology: CacheTopology) {
        self.last_topology_id = self.last_topology_id.max(topology.topology_id);
        self.last_rebalance_id = self.last_rebalance_id.max(topology.rebalance_id);
        log_topology_update(&self.cache_name, &topology, self.availability_mode);
        let owners = topology.current_ch.members().to_vec();
        self.joiners.retain(|joiner| !owners.contains(joiner));
        self.current_topology = Some(topology);
    }

    fn with_persistent_ids(&self, members: &[NodeId]) -> (Vec<NodeId>, Vec<PersistentId>) {
        members
            .iter()
            .filter_map(|member| {
                self.services
                    .identity
                    .get_persistent_id(member)
                    .map(|id| (member.clone(), id))
            })
            .unzip()
    }

    fn create_initial_topology(&mut self, members: &[NodeId]) {
        let ch = self.services.factory.create(
            self.join_info.num_owners,
            self.join_info.num_segments,
            members,
            &self.capacity_factors,
        );
        let (actual_members, persistent_ids) = self.with_persistent_ids(members);
        let topology = CacheTopology::new(
            self.next_topology_id(),
            self.next_rebalance_id(),
            ch,
            None,
            Phase::NoRebalance,
            actual_members,
            persistent_ids,
        );
        self.install_topology(topology);
    }

    fn broadcast_topology(&mut self, kind: TopologyUpdateKind) {
        let Some(topology) = self.current_topology.clone() else {
            return;
        };
        self.services
            .metrics
            .record_topology_broadcast(&self.cache_name, topology.topology_id);
        self.outbox.push(CacheAction::Broadcast(ControlCommand::TopologyUpdate {
            cache_name: self.cache_name.clone(),
            kind,
            topology,
            availability_mode: self.availability_mode,
        }));
    }

    fn broadcast_rebalance_start(&mut self) {
        let Some(topology) = self.current_topology.clone() else {
            return;
        };
        self.services
            .metrics
            .record_topology_broadcast(&self.cache_name, topology.topology_id);
        self.outbox.push(CacheAction::Broadcast(ControlCommand::RebalanceStart {
            cache_name: self.cache_name.clone(),
            topology,
            availability_mode: self.availability_mode,
        }));
    }

    /// New barrier for the current topology, if it is rebalancing
    fn reset_collector(&mut self) {
        self.collector = match &self.current_topology {
            Some(topology) if topology.is_rebalance_in_progress() => {
                Some(RebalanceConfirmationCollector::new(
                    self.cache_name.clone(),
                    topology.topology_id,
                    topology.actual_members.clone(),
                ))
            }
            _ => None,
        };
    }

    fn update_collector_members(&mut self) {
        let completed = match self.collector.as_mut() {
            Some(collector) => collector.update_members(&self.expected_members),
            None => false,
        };
        if completed {
            self.on_phase_complete();
        }
    }

    fn on_phase_complete(&mut self) {
        self.collector = None;
        let Some(current) = self.current_topology.clone() else {
            return;
        };
        match self.rebalance_type.next_phase(current.phase) {
            Some(next) => {
                let topology = CacheTopology {
                    topology_id: self.next_topology_id(),
                    phase: next,
                    ..current
                };
                self.services.events.record(
                    Some(&self.cache_name),
                    ClusterEventKind::RebalancePhaseAdvanced,
                    format!("{:?} in topology {}", next, topology.topology_id),
                );
                self.install_topology(topology);
                self.broadcast_topology(TopologyUpdateKind::ReadCh);
                self.reset_collector();
            }
            None => self.end_rebalance(current),
        }
    }

    fn end_rebalance(&mut self, current: CacheTopology) {
        let Some(pending) = current.pending_ch.clone() else {
            return;
        };
        let topology = CacheTopology::new(
            self.next_topology_id(),
            current.rebalance_id,
            pending,
            None,
            Phase::NoRebalance,
            current.actual_members,
            current.persistent_ids,
        );
        tracing::info!(
            "Finished rebalance {} of cache {} in topology {}",
            topology.rebalance_id,
            self.cache_name,
            topology.topology_id
        );
        self.services.metrics.record_rebalance_completed(&self.cache_name);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::RebalanceFinished,
            format!(
                "rebalance {} in topology {}",
                topology.rebalance_id, topology.topology_id
            ),
        );
        self.install_topology(topology);
        self.broadcast_topology(TopologyUpdateKind::WriteCh);

        let strategy = Arc::clone(&self.strategy);
        strategy.on_rebalance_end(self);
        self.start_queued_rebalance();
    }

    fn queue_conflict_resolution(&mut self) {
        let Some(topology) = self.current_topology.clone() else {
            return;
        };
        tracing::info!(
            "Resolving conflicts of cache {} in topology {}",
            self.cache_name,
            topology.topology_id
        );
        self.conflict_resolution = Some(topology.topology_id);
        self.services.metrics.record_conflict_resolution(&self.cache_name);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::ConflictResolutionStarted,
            format!("topology {}", topology.topology_id),
        );
        self.outbox.push(CacheAction::ResolveConflicts(topology));
    }

    fn cancel_conflict_resolution(&mut self) {
        let Some(topology_id) = self.conflict_resolution.take() else {
            return;
        };
        tracing::info!(
            "Cancelling conflict resolution {} of cache {}: a single member remains",
            topology_id,
            self.cache_name
        );
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::ConflictResolutionCancelled,
            format!("topology {}", topology_id),
        );
        self.leave_conflict_resolution_phase();
    }

    /// Members left while conflicts were being resolved: resolve again over
    /// the remaining ones
    fn restart_conflict_resolution(&mut self) {
        let Some(current) = self.current_topology.clone() else {
            return;
        };
        let members = self.expected_members.clone();
        let ch = self.pruned_ownership(&current.current_ch, &members);
        let (actual_members, persistent_ids) = self.with_persistent_ids(&members);
        let topology = CacheTopology::new(
            self.next_topology_id(),
            self.next_rebalance_id(),
            ch,
            None,
            Phase::ConflictResolution,
            actual_members,
            persistent_ids,
        );
        tracing::info!(
            "Restarting conflict resolution of cache {} in topology {}",
            self.cache_name,
            topology.topology_id
        );
        self.install_topology(topology);
        self.broadcast_topology(TopologyUpdateKind::Ch);
        self.queued_rebalance_members = Some(members);
        self.queue_conflict_resolution();
    }

    fn leave_conflict_resolution_phase(&mut self) {
        let Some(current) = self.current_topology.clone() else {
            return;
        };
        if current.phase != Phase::ConflictResolution {
            return;
        }
        let ch = self.pruned_ownership(&current.current_ch, &self.expected_members.clone());
        let topology = CacheTopology {
            topology_id: self.next_topology_id(),
            current_ch: ch,
            phase: Phase::NoRebalance,
            ..current
        }
        .with_actual_members(&self.expected_members);
        self.install_topology(topology);
        self.broadcast_topology(TopologyUpdateKind::Ch);
    }

    fn pruned_ownership(&self, ch: &ConsistentHash, members: &[NodeId]) -> ConsistentHash {
        let survivors: Vec<NodeId> = ch
            .members()
            .iter()
            .filter(|m| members.contains(m))
            .cloned()
            .collect();
        if survivors.is_empty() {
            return self.services.factory.create(
                self.join_info.num_owners,
                self.join_info.num_segments,
                members,
                &self.capacity_factors,
            );
        }
        self.services
            .factory
            .update_members(ch, &survivors, &self.capacity_factors)
    }

    /// Persistent identities of the recorded state whose node has not rejoined
    fn missing_persisted_members(&self) -> Vec<String> {
        let Some(state) = &self.persisted_state else {
            return Vec::new();
        };
        state
            .members()
            .iter()
            .filter(|persistent_id| {
                self.services
                    .identity
                    .get_address(persistent_id)
                    .map_or(true, |address| !self.expected_members.contains(&address))
            })
            .map(|persistent_id| persistent_id.to_string())
            .collect()
    }

    /// Install the recorded ownership once every recorded member is back
    fn try_restore_persisted_state(&mut self) {
        let missing = self.missing_persisted_members();
        if !missing.is_empty() {
            tracing::info!(
                "Cache {} waits for {} persisted member(s) before restoring",
                self.cache_name,
                missing.len()
            );
            return;
        }
        let Some(state) = self.persisted_state.take() else {
            return;
        };
        let Some(ch) = self.services.identity.to_addresses(&state.consistent_hash) else {
            tracing::warn!(
                "Cannot map persisted owners of cache {} to addresses",
                self.cache_name
            );
            self.persisted_state = Some(state);
            return;
        };

        let members = self.expected_members.clone();
        let (actual_members, persistent_ids) = self.with_persistent_ids(&members);
        let topology = CacheTopology::new(
            self.next_topology_id(),
            self.next_rebalance_id(),
            ch,
            None,
            Phase::NoRebalance,
            actual_members,
            persistent_ids,
        );
        tracing::info!(
            "Restored persisted state of cache {} as topology {}",
            self.cache_name,
            topology.topology_id
        );
        self.services.state_store.remove(&self.cache_name);
        self.services.events.record(
            Some(&self.cache_name),
            ClusterEventKind::StateRestored,
            format!("topology {}", topology.topology_id),
        );
        self.install_topology(topology);
        self.stable_topology = self.current_topology.clone();
        self.broadcast_topology(TopologyUpdateKind::Ch);
        self.queue_rebalance(members);
    }
}

impl AvailabilityStrategyContext for ClusterCacheStatus {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn join_info(&self) -> Option<&CacheJoinInfo> {
        Some(&self.join_info)
    }

    fn expected_members(&self) -> Vec<NodeId> {
        self.expected_members.clone()
    }

    fn current_topology(&self) -> Option<&CacheTopology> {
        self.current_topology.as_ref()
    }

    fn stable_topology(&self) -> Option<&CacheTopology> {
        self.stable_topology.as_ref()
    }

    fn availability_mode(&self) -> AvailabilityMode {
        self.availability_mode
    }

    fn consistent_hash_factory(&self) -> Arc<dyn ConsistentHashFactory> {
        Arc::clone(&self.services.factory)
    }

    fn queue_rebalance(&mut self, members: Vec<NodeId>) {
        self.queued_rebalance_members = Some(members);
        self.start_queued_rebalance();
    }

    fn update_current_topology(&mut self, members: &[NodeId]) {
        let Some(current) = self.current_topology.clone() else {
            if !members.is_empty() {
                self.create_initial_topology(members);
                self.broadcast_topology(TopologyUpdateKind::Ch);
            }
            return;
        };
        if members.is_empty() {
            return;
        }

        let factory = Arc::clone(&self.services.factory);
        let survivors: Vec<NodeId> = current
            .current_ch
            .members()
            .iter()
            .filter(|m| members.contains(m))
            .cloned()
            .collect();

        let (current_ch, pending_ch, phase, actual) = if survivors.is_empty() {
            tracing::warn!(
                "No owner of cache {} survived, creating new ownership over {:?}",
                self.cache_name,
                members
            );
            let ch = factory.create(
                self.join_info.num_owners,
                self.join_info.num_segments,
                members,
                &self.capacity_factors,
            );
            (ch, None, Phase::NoRebalance, members.to_vec())
        } else {
            let current_ch = factory.update_members(&current.current_ch, &survivors, &self.capacity_factors);
            let pending_ch = current.pending_ch.as_ref().and_then(|pending| {
                let pending_members: Vec<NodeId> = pending
                    .members()
                    .iter()
                    .filter(|m| members.contains(m))
                    .cloned()
                    .collect();
                if pending_members.is_empty() {
                    None
                } else {
                    Some(factory.update_members(pending, &pending_members, &self.capacity_factors))
                }
            });
            let phase = match (&pending_ch, current.phase) {
                (None, phase) if phase.is_rebalance() => Phase::NoRebalance,
                (_, phase) => phase,
            };
            let actual: Vec<NodeId> = current
                .actual_members
                .iter()
                .filter(|m| members.contains(m))
                .cloned()
                .collect();
            (current_ch, pending_ch, phase, actual)
        };

        // Members restart their transfer for the pruned pending ownership
        let rebalance_id = if pending_ch.is_some() {
            self.next_rebalance_id()
        } else {
            current.rebalance_id
        };
        let (actual_members, persistent_ids) = self.with_persistent_ids(&actual);
        let topology = CacheTopology::new(
            self.next_topology_id(),
            rebalance_id,
            current_ch,
            pending_ch,
            phase,
            actual_members,
            persistent_ids,
        );
        self.install_topology(topology);
        self.broadcast_topology(TopologyUpdateKind::Ch);
        self.reset_collector();
    }

    fn update_availability_mode(
        &mut self,
        actual_members: &[NodeId],
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    ) {
        let mode_changed = mode != self.availability_mode;
        if mode_changed {
            tracing::info!(
                "Cache {} availability changes from {:?} to {:?}",
                self.cache_name,
                self.availability_mode,
                mode
            );
            self.services.events.record(
                Some(&self.cache_name),
                ClusterEventKind::AvailabilityChanged,
                format!("{:?} -> {:?}", self.availability_mode, mode),
            );
        }
        self.availability_mode = mode;

        let Some(current) = self.current_topology.clone() else {
            return;
        };
        let members_changed = current.actual_members.as_slice() != actual_members;
        let cancel = cancel_rebalance && current.is_rebalance_in_progress();
        if !mode_changed && !members_changed && !cancel {
            return;
        }

        let topology = if cancel {
            self.collector = None;
            current.cancel_rebalance(self.next_topology_id(), self.next_rebalance_id())
        } else {
            CacheTopology {
                topology_id: self.next_topology_id(),
                ..current
            }
        };
        let topology = topology.with_actual_members(actual_members);
        self.install_topology(topology);
        self.broadcast_topology(TopologyUpdateKind::Ch);
        self.update_collector_members();
    }

    fn update_topologies_after_merge(
        &mut self,
        current: Option<CacheTopology>,
        stable: Option<CacheTopology>,
        mode: AvailabilityMode,
        resolve_conflicts: bool,
    ) {
        self.availability_mode = mode;
        self.collector = None;
        if let Some(stable) = &stable {
            self.last_topology_id = self.last_topology_id.max(stable.topology_id);
            self.last_rebalance_id = self.last_rebalance_id.max(stable.rebalance_id);
        }
        self.stable_topology = stable;

        let Some(current) = current else {
            return;
        };
        self.install_topology(current);
        self.broadcast_topology(TopologyUpdateKind::Ch);
        if resolve_conflicts {
            self.queue_conflict_resolution();
        }
    }

    fn update_stable_topology(&mut self) {
        let Some(current) = self.current_topology.clone() else {
            return;
        };
        self.stable_topology = Some(current.clone());
        self.outbox.push(CacheAction::Broadcast(ControlCommand::StableTopologyUpdate {
            cache_name: self.cache_name.clone(),
            topology: current,
        }));
    }
}
