//! A cluster node running both topology services
//!
//! `TopologyNode` owns the view tracker shared by the coordinator service
//! and the member service, feeds them the views delivered by the membership
//! layer and routes every incoming control message to the service it is
//! addressed to.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterView, Transport, ViewTracker};
use crate::config::TopologyConfig;
use crate::coordinator::{
    CacheStatusServices, ClusterTopologyManager, ConflictResolver, InMemoryStateStore,
    NoopConflictResolver, PersistentStateStore,
};
use crate::error::{Result, TopologyError};
use crate::events::ClusterEventLog;
use crate::member::{CacheTopologyHandler, LocalTopologyManager};
use crate::metrics::TopologyMetrics;
use crate::protocol::{ControlCommand, ControlMessage, ControlResponse};
use crate::topology::{
    CacheJoinInfo, CacheMode, CacheStatusResponse, ConsistentHashFactory, NodeId, PersistentId,
    PersistentIdentityManager, RingConsistentHashFactory,
};

pub struct TopologyNodeBuilder {
    config: TopologyConfig,
    transport: Arc<dyn Transport>,
    factory: Arc<dyn ConsistentHashFactory>,
    state_store: Arc<dyn PersistentStateStore>,
    conflict_resolver: Arc<dyn ConflictResolver>,
}

impl TopologyNodeBuilder {
    pub fn with_factory(mut self, factory: Arc<dyn ConsistentHashFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_state_store(mut self, state_store: Arc<dyn PersistentStateStore>) -> Self {
        self.state_store = state_store;
        self
    }

    pub fn with_conflict_resolver(mut self, conflict_resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = conflict_resolver;
        self
    }

    pub fn build(self) -> Result<TopologyNode> {
        self.config
            .validate()
            .map_err(|errors| TopologyError::Configuration(errors.join("; ")))?;
        let persistent_id = match &self.config.node.persistent_id {
            Some(hex) => hex
                .parse::<PersistentId>()
                .map_err(|e| TopologyError::Configuration(format!("persistent id {}: {}", hex, e)))?,
            None => PersistentId::random(),
        };

        let views = ViewTracker::new();
        let metrics = Arc::new(TopologyMetrics::new());
        let events = Arc::new(ClusterEventLog::new(self.config.coordinator.event_log_capacity));
        let services = CacheStatusServices {
            factory: Arc::clone(&self.factory),
            identity: Arc::new(PersistentIdentityManager::new()),
            state_store: self.state_store,
            events: Arc::clone(&events),
            metrics: Arc::clone(&metrics),
            global_rebalancing: Arc::new(AtomicBool::new(self.config.coordinator.rebalancing_enabled)),
        };
        let coordinator = ClusterTopologyManager::new(
            self.config.coordinator.clone(),
            Arc::clone(&self.transport),
            views.clone(),
            services,
            self.conflict_resolver,
        );
        let member = LocalTopologyManager::new(
            self.config.member.clone(),
            Arc::clone(&self.transport),
            views.clone(),
            self.factory,
            Arc::clone(&metrics),
        );
        tracing::info!(
            "Topology node {} started with persistent id {}",
            self.transport.local_node(),
            persistent_id
        );

        Ok(TopologyNode {
            node_id: self.transport.local_node().clone(),
            persistent_id,
            capacity_factor: self.config.node.capacity_factor,
            join_timeout: self.config.member.join_duration(),
            views,
            coordinator,
            member,
            metrics,
            events,
        })
    }
}

pub struct TopologyNode {
    node_id: NodeId,
    persistent_id: PersistentId,
    capacity_factor: f32,
    join_timeout: Duration,
    views: ViewTracker,
    coordinator: ClusterTopologyManager,
    member: LocalTopologyManager,
    metrics: Arc<TopologyMetrics>,
    events: Arc<ClusterEventLog>,
}

impl TopologyNode {
    /// Builder with the ring factory, an in-memory state store and no
    /// conflict resolver
    pub fn builder(config: TopologyConfig, transport: Arc<dyn Transport>) -> TopologyNodeBuilder {
        TopologyNodeBuilder {
            config,
            transport,
            factory: Arc::new(RingConsistentHashFactory::default()),
            state_store: Arc::new(InMemoryStateStore::new()),
            conflict_resolver: Arc::new(NoopConflictResolver),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn persistent_id(&self) -> PersistentId {
        self.persistent_id
    }

    pub fn coordinator(&self) -> &ClusterTopologyManager {
        &self.coordinator
    }

    pub fn member(&self) -> &LocalTopologyManager {
        &self.member
    }

    pub fn views(&self) -> &ViewTracker {
        &self.views
    }

    pub fn metrics(&self) -> &Arc<TopologyMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &Arc<ClusterEventLog> {
        &self.events
    }

    /// Join parameters for this node
    pub fn join_info(&self, cache_mode: CacheMode, num_segments: usize, num_owners: usize) -> CacheJoinInfo {
        let mut join_info = CacheJoinInfo::new(cache_mode, num_segments, num_owners, self.persistent_id);
        join_info.capacity_factor = self.capacity_factor;
        join_info.timeout_ms = self.join_timeout.as_millis() as u64;
        join_info
    }

    pub async fn join(
        &self,
        cache_name: &str,
        join_info: CacheJoinInfo,
        handler: Arc<dyn CacheTopologyHandler>,
    ) -> Result<CacheStatusResponse> {
        self.member.join(cache_name, join_info, handler).await
    }

    pub async fn leave(&self, cache_name: &str) -> Result<()> {
        self.member.leave(cache_name).await
    }

    /// Install a view delivered by the membership layer
    pub async fn install_view(&self, view: ClusterView) {
        if !self.views.install(view.clone()) {
            tracing::debug!("Node {} ignoring outdated view {}", self.node_id, view.view_id);
            return;
        }
        tracing::info!(
            "Node {} installed view {} {:?}{}",
            self.node_id,
            view.view_id,
            view.members,
            if view.is_merge { " (merge)" } else { "" }
        );
        self.coordinator.handle_view_change(&view).await;
    }

    /// Route one incoming control message
    pub async fn handle_message(&self, message: ControlMessage) -> ControlResponse {
        let ControlMessage {
            sender,
            view_id,
            command,
        } = message;
        tracing::trace!("Node {} handling {} from {}", self.node_id, command.name(), sender);

        let result = match command {
            ControlCommand::Join {
                cache_name,
                join_info,
            } => self
                .coordinator
                .handle_join(&sender, &cache_name, &join_info, view_id)
                .await
                .map(ControlResponse::Join),
            ControlCommand::Leave { cache_name } => self
                .coordinator
                .handle_leave(&sender, &cache_name, view_id)
                .await
                .map(|_| ControlResponse::Ack),
            ControlCommand::RebalanceConfirm {
                cache_name,
                topology_id,
                error,
            } => self
                .coordinator
                .handle_rebalance_confirm(&sender, &cache_name, topology_id, error.as_deref(), view_id)
                .await
                .map(|_| ControlResponse::Ack),
            ControlCommand::TopologyUpdate {
                cache_name,
                kind,
                topology,
                availability_mode,
            } => {
                self.member
                    .handle_topology_update(&sender, view_id, &cache_name, kind, topology, availability_mode)
                    .await;
                Ok(ControlResponse::Ack)
            }
            ControlCommand::RebalanceStart {
                cache_name,
                topology,
                availability_mode,
            } => {
                self.member
                    .handle_rebalance_start(&sender, view_id, &cache_name, topology, availability_mode)
                    .await;
                Ok(ControlResponse::Ack)
            }
            ControlCommand::StableTopologyUpdate {
                cache_name,
                topology,
            } => {
                self.member
                    .handle_stable_topology_update(&sender, view_id, &cache_name, topology)
                    .await;
                Ok(ControlResponse::Ack)
            }
            ControlCommand::GetStatus => self
                .member
                .handle_status_request(view_id)
                .await
                .map(ControlResponse::Status),
            ControlCommand::PolicyGetStatus { cache_name } => self
                .coordinator
                .is_rebalancing_enabled(cache_name.as_deref())
                .await
                .map(ControlResponse::Bool),
            ControlCommand::PolicyEnable { cache_name } => self
                .coordinator
                .set_rebalancing_enabled(cache_name.as_deref(), true)
                .await
                .map(|_| ControlResponse::Bool(true)),
            ControlCommand::PolicyDisable { cache_name } => self
                .coordinator
                .set_rebalancing_enabled(cache_name.as_deref(), false)
                .await
                .map(|_| ControlResponse::Bool(true)),
            ControlCommand::RebalancePolicyUpdate { enabled } => {
                self.member.handle_rebalance_policy_update(enabled);
                Ok(ControlResponse::Ack)
            }
            ControlCommand::AvailabilityModeChange { cache_name, mode } => self
                .coordinator
                .set_availability_mode(&cache_name, mode)
                .await
                .map(|_| ControlResponse::Bool(true)),
            ControlCommand::ForceRebalance { cache_name } => self
                .coordinator
                .force_rebalance(&cache_name)
                .await
                .map(|_| ControlResponse::Ack),
            ControlCommand::ShutdownRequest { cache_name } => self
                .coordinator
                .handle_shutdown_request(&cache_name)
                .await
                .map(|_| ControlResponse::Ack),
            ControlCommand::ShutdownPerform {
                cache_name,
                topology,
            } => self
                .member
                .handle_shutdown_perform(&sender, view_id, &cache_name, topology)
                .await
                .map(|_| ControlResponse::Ack),
            ControlCommand::Heartbeat => Ok(ControlResponse::Ack),
        };

        result.unwrap_or_else(ControlResponse::Error)
    }

    /// Stop both services
    pub async fn stop(&self) {
        self.member.stop().await;
        self.coordinator.stop().await;
    }
}
