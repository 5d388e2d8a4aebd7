//! Cluster coordinator service
//!
//! Runs on every node but only acts while the local node is the coordinator
//! of the installed view. It owns one `ClusterCacheStatus` per cache, rebuilds
//! them from the members' reports after becoming coordinator or after a
//! merge, and serves the control requests members send to the coordinator.

pub mod cache_status;
pub mod conflict;
pub mod state_store;

pub use cache_status::{CacheAction, CacheStatusServices, ClusterCacheStatus};
pub use conflict::{ConflictResolver, NoopConflictResolver};
pub use state_store::{InMemoryStateStore, PersistentStateStore};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::cluster::{ClusterView, Transport, ViewTracker};
use crate::config::CoordinatorConfig;
use crate::error::{Result, TopologyError};
use crate::events::ClusterEventLog;
use crate::log::log_cluster_operation;
use crate::metrics::TopologyMetrics;
use crate::partition::AvailabilityStrategyContext;
use crate::protocol::{ControlCommand, ControlMessage, ControlResponse};
use crate::retry::{retry, RetryPolicy};
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ManagerStatusResponse,
    NodeId, RebalanceId, TopologyId, ViewId,
};

/// Coordinator duties of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterManagerStatus {
    Initializing,
    RegularMember,
    /// Collecting member reports after becoming coordinator or a merge
    RecoveringCluster,
    Coordinator,
    Stopping,
}

type CacheHandle = Arc<Mutex<ClusterCacheStatus>>;

/// Coordinator-side topology service
#[derive(Clone)]
pub struct ClusterTopologyManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local_node: NodeId,
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    views: ViewTracker,
    services: CacheStatusServices,
    conflict_resolver: Arc<dyn ConflictResolver>,
    status: StdRwLock<ClusterManagerStatus>,
    caches: RwLock<HashMap<String, CacheHandle>>,
    /// Serializes view handling; holds the last handled view id
    view_handling: Mutex<Option<ViewId>>,
    retired_ids: StdRwLock<HashMap<String, (TopologyId, RebalanceId)>>,
    cache_tasks: Arc<Semaphore>,
}

impl ClusterTopologyManager {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        views: ViewTracker,
        services: CacheStatusServices,
        conflict_resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        services
            .global_rebalancing
            .store(config.rebalancing_enabled, Ordering::SeqCst);
        let cache_tasks = Arc::new(Semaphore::new(config.max_concurrent_cache_tasks.max(1)));
        Self {
            inner: Arc::new(ManagerInner {
                local_node: transport.local_node().clone(),
                config,
                transport,
                views,
                services,
                conflict_resolver,
                status: StdRwLock::new(ClusterManagerStatus::Initializing),
                caches: RwLock::new(HashMap::new()),
                view_handling: Mutex::new(None),
                retired_ids: StdRwLock::new(HashMap::new()),
                cache_tasks,
            }),
        }
    }

    pub fn status(&self) -> ClusterManagerStatus {
        *self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ClusterManagerStatus) {
        let mut current = self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            tracing::info!(
                "Node {} coordinator status {:?} -> {:?}",
                self.inner.local_node,
                *current,
                status
            );
            *current = status;
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.status() == ClusterManagerStatus::Coordinator
    }

    pub fn events(&self) -> &Arc<ClusterEventLog> {
        &self.inner.services.events
    }

    pub fn metrics(&self) -> &Arc<TopologyMetrics> {
        &self.inner.services.metrics
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the coordinator's view of a cache
    pub async fn cache_status(&self, cache_name: &str) -> Option<CacheStatusResponse> {
        let cache = self.cache(cache_name).await?;
        let status = cache.lock().await;
        Some(status.status_response())
    }

    /// Members the active rebalance phase of a cache still waits for
    pub async fn pending_confirmations(&self, cache_name: &str) -> Vec<NodeId> {
        match self.cache(cache_name).await {
            Some(cache) => cache.lock().await.pending_confirmations(),
            None => Vec::new(),
        }
    }

    /// Stop acting as coordinator; later requests fail
    pub async fn stop(&self) {
        self.set_status(ClusterManagerStatus::Stopping);
        self.inner.caches.write().await.clear();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status() == ClusterManagerStatus::Stopping {
            return Err(TopologyError::IllegalLifecycleState(format!(
                "coordinator service on {} is stopping",
                self.inner.local_node
            )));
        }
        Ok(())
    }

    fn ensure_coordinator(&self) -> Result<()> {
        self.ensure_running()?;
        if !self.is_coordinator() {
            return Err(TopologyError::NotCoordinator {
                node: self.inner.local_node.clone(),
            });
        }
        Ok(())
    }

    async fn wait_for_view(&self, view_id: ViewId) -> Result<()> {
        self.inner
            .views
            .wait_for_view(view_id, self.inner.config.view_wait_duration())
            .await
            .map(|_| ())
    }

    async fn cache(&self, cache_name: &str) -> Option<CacheHandle> {
        self.inner.caches.read().await.get(cache_name).cloned()
    }

    async fn existing_cache(&self, cache_name: &str) -> Result<CacheHandle> {
        self.cache(cache_name)
            .await
            .ok_or_else(|| TopologyError::CacheNotFound(cache_name.to_string()))
    }

    async fn is_registered(&self, cache_name: &str, cache: &CacheHandle) -> bool {
        self.inner
            .caches
            .read()
            .await
            .get(cache_name)
            .map_or(false, |registered| Arc::ptr_eq(registered, cache))
    }

    fn retired(&self, cache_name: &str) -> Option<(TopologyId, RebalanceId)> {
        self.inner
            .retired_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cache_name)
            .copied()
    }

    async fn get_or_create_cache(&self, cache_name: &str, join_info: &CacheJoinInfo) -> CacheHandle {
        if let Some(cache) = self.cache(cache_name).await {
            return cache;
        }
        let mut caches = self.inner.caches.write().await;
        let cache = match caches.entry(cache_name.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                tracing::info!("Creating coordinator state for cache {}", cache_name);
                let status = ClusterCacheStatus::new(
                    cache_name,
                    join_info.clone(),
                    self.inner.services.clone(),
                    self.retired(cache_name),
                );
                Arc::clone(entry.insert(Arc::new(Mutex::new(status))))
            }
        };
        self.inner.services.metrics.update_cache_count(caches.len());
        cache
    }

    /// Drop an empty cache, remembering its ids. The caller holds its lock.
    async fn retire_cache(&self, cache_name: &str, status: &ClusterCacheStatus) {
        tracing::info!("Cache {} has no members left, removing it", cache_name);
        self.inner
            .retired_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_name.to_string(), status.retired_ids());
        let mut caches = self.inner.caches.write().await;
        caches.remove(cache_name);
        self.inner.services.metrics.update_cache_count(caches.len());
    }

    async fn execute_actions(&self, cache_name: &str, actions: Vec<CacheAction>) {
        for action in actions {
            match action {
                CacheAction::Broadcast(command) => self.broadcast(command).await,
                CacheAction::ResolveConflicts(topology) => {
                    self.spawn_conflict_resolution(cache_name, topology)
                }
            }
        }
    }

    async fn broadcast(&self, command: ControlCommand) {
        let Some(view) = self.inner.views.current() else {
            return;
        };
        let name = command.name();
        let message = ControlMessage::new(self.inner.local_node.clone(), view.view_id, command);
        for (target, result) in self.inner.transport.send_to_many(&view.members, message).await {
            if let Err(e) = result {
                tracing::debug!("Failed to send {} to {}: {}", name, target, e);
            }
        }
    }

    fn spawn_conflict_resolution(&self, cache_name: &str, topology: CacheTopology) {
        let manager = self.clone();
        let cache_name = cache_name.to_string();
        tokio::spawn(async move {
            let outcome = manager
                .inner
                .conflict_resolver
                .resolve_conflicts(&cache_name, &topology)
                .await;
            manager
                .complete_conflict_resolution(&cache_name, topology.topology_id, outcome)
                .await;
        });
    }

    async fn complete_conflict_resolution(&self, cache_name: &str, topology_id: TopologyId, outcome: Result<()>) {
        let Some(cache) = self.cache(cache_name).await else {
            tracing::debug!("Cache {} vanished during conflict resolution", cache_name);
            return;
        };
        let mut status = cache.lock().await;
        status.complete_conflict_resolution(topology_id, outcome);
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
    }

    /// JOIN from `joiner`, sent in view `view_id`
    pub async fn handle_join(
        &self,
        joiner: &NodeId,
        cache_name: &str,
        join_info: &CacheJoinInfo,
        view_id: ViewId,
    ) -> Result<CacheStatusResponse> {
        let started = Instant::now();
        self.wait_for_view(view_id).await?;
        self.ensure_coordinator()?;

        let result = loop {
            let cache = self.get_or_create_cache(cache_name, join_info).await;
            let mut status = cache.lock().await;
            if !self.is_registered(cache_name, &cache).await {
                continue;
            }
            let result = status.join(joiner, join_info);
            let actions = status.take_actions();
            self.execute_actions(cache_name, actions).await;
            if status.is_empty() {
                self.retire_cache(cache_name, &status).await;
            }
            break result;
        };

        log_cluster_operation(
            "join",
            joiner.as_str(),
            result.is_ok(),
            started.elapsed(),
            Some(vec![("cache", cache_name.to_string())]),
        );
        result
    }

    /// LEAVE from `leaver`
    pub async fn handle_leave(&self, leaver: &NodeId, cache_name: &str, view_id: ViewId) -> Result<()> {
        self.wait_for_view(view_id).await?;
        self.ensure_coordinator()?;
        let Some(cache) = self.cache(cache_name).await else {
            tracing::debug!("Ignoring leave of {} from unknown cache {}", leaver, cache_name);
            return Ok(());
        };
        let mut status = cache.lock().await;
        if !status.leave(leaver) {
            return Ok(());
        }
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        if status.is_empty() {
            self.retire_cache(cache_name, &status).await;
        }
        Ok(())
    }

    /// REBALANCE_CONFIRM from `member` for `topology_id`
    pub async fn handle_rebalance_confirm(
        &self,
        member: &NodeId,
        cache_name: &str,
        topology_id: TopologyId,
        error: Option<&str>,
        view_id: ViewId,
    ) -> Result<()> {
        self.wait_for_view(view_id).await?;
        self.ensure_coordinator()?;
        if let Some(error) = error {
            tracing::warn!(
                "{} reported a failed state transfer for cache {} topology {}: {}",
                member,
                cache_name,
                topology_id,
                error
            );
        }
        let Some(cache) = self.cache(cache_name).await else {
            tracing::debug!("Ignoring confirmation for unknown cache {}", cache_name);
            return Ok(());
        };
        let mut status = cache.lock().await;
        status.confirm_phase(member, topology_id);
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        Ok(())
    }

    /// Rebalancing switch of one cache, or the cluster-wide one
    pub async fn is_rebalancing_enabled(&self, cache_name: Option<&str>) -> Result<bool> {
        self.ensure_coordinator()?;
        match cache_name {
            None => Ok(self.inner.services.global_rebalancing.load(Ordering::SeqCst)),
            Some(name) => {
                let cache = self.existing_cache(name).await?;
                let status = cache.lock().await;
                Ok(status.is_rebalancing_enabled())
            }
        }
    }

    pub async fn set_rebalancing_enabled(&self, cache_name: Option<&str>, enabled: bool) -> Result<()> {
        self.ensure_coordinator()?;
        match cache_name {
            Some(name) => {
                let cache = self.existing_cache(name).await?;
                let mut status = cache.lock().await;
                status.set_rebalancing_enabled(enabled);
                let actions = status.take_actions();
                self.execute_actions(name, actions).await;
            }
            None => {
                tracing::info!(
                    "Rebalancing {} cluster-wide",
                    if enabled { "enabled" } else { "disabled" }
                );
                self.inner
                    .services
                    .global_rebalancing
                    .store(enabled, Ordering::SeqCst);
                self.broadcast(ControlCommand::RebalancePolicyUpdate { enabled })
                    .await;
                if enabled {
                    let caches: Vec<(String, CacheHandle)> = self
                        .inner
                        .caches
                        .read()
                        .await
                        .iter()
                        .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
                        .collect();
                    for (name, cache) in caches {
                        let mut status = cache.lock().await;
                        status.start_queued_rebalance();
                        let actions = status.take_actions();
                        self.execute_actions(&name, actions).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Administrative availability override
    pub async fn set_availability_mode(&self, cache_name: &str, mode: AvailabilityMode) -> Result<()> {
        self.ensure_coordinator()?;
        let cache = self.existing_cache(cache_name).await?;
        let mut status = cache.lock().await;
        status.set_availability_mode(mode);
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        Ok(())
    }

    pub async fn force_rebalance(&self, cache_name: &str) -> Result<()> {
        self.ensure_coordinator()?;
        let cache = self.existing_cache(cache_name).await?;
        let mut status = cache.lock().await;
        let result = status.force_rebalance();
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        result
    }

    /// SHUTDOWN_REQUEST: stop the cache on every member, keeping its state
    pub async fn handle_shutdown_request(&self, cache_name: &str) -> Result<()> {
        self.ensure_coordinator()?;
        let cache = self.existing_cache(cache_name).await?;
        let mut status = cache.lock().await;
        status.shutdown();
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        self.retire_cache(cache_name, &status).await;
        Ok(())
    }

    /// React to a newly installed view
    pub async fn handle_view_change(&self, view: &ClusterView) {
        let mut last_handled = self.inner.view_handling.lock().await;
        if last_handled.map_or(false, |last| last >= view.view_id) {
            return;
        }
        *last_handled = Some(view.view_id);
        if self.ensure_running().is_err() {
            return;
        }

        if view.coordinator() != Some(&self.inner.local_node) {
            if self.status() != ClusterManagerStatus::RegularMember {
                self.inner.caches.write().await.clear();
            }
            self.set_status(ClusterManagerStatus::RegularMember);
            return;
        }

        let became_coordinator = self.status() != ClusterManagerStatus::Coordinator;
        if became_coordinator || view.is_merge {
            self.recover(view).await;
            return;
        }

        if !self.check_liveness(view).await {
            tracing::warn!(
                "Skipping reconciliation for view {}: some members did not answer the heartbeat",
                view.view_id
            );
            return;
        }
        self.reconcile_caches(view).await;
    }

    async fn recover(&self, view: &ClusterView) {
        self.set_status(ClusterManagerStatus::RecoveringCluster);
        self.inner.caches.write().await.clear();

        let started = Instant::now();
        let result = self.recover_cluster(view).await;
        let elapsed = started.elapsed();
        self.inner
            .services
            .metrics
            .record_recovery(result.is_ok(), elapsed);
        log_cluster_operation(
            "cluster_recovery",
            self.inner.local_node.as_str(),
            result.is_ok(),
            elapsed,
            Some(vec![("view_id", view.view_id.to_string())]),
        );
        match result {
            Ok(()) => self.set_status(ClusterManagerStatus::Coordinator),
            Err(e) => tracing::error!(
                "Cluster recovery for view {} failed, coordinator duties suspended: {}",
                view.view_id,
                e
            ),
        }
    }

    /// Rebuild every cache from the members' status reports
    async fn recover_cluster(&self, view: &ClusterView) -> Result<()> {
        let config = &self.inner.config;
        let policy = RetryPolicy::new(
            config.status_fetch_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        );
        let message = ControlMessage::new(
            self.inner.local_node.clone(),
            view.view_id,
            ControlCommand::GetStatus,
        );
        let timeout = config.status_fetch_duration();
        let transport = self.inner.transport.as_ref();
        let responses = retry(&policy, "cluster status recovery", |_| {
            fetch_statuses(transport, &view.members, message.clone(), timeout)
        })
        .await?;

        let rebalancing_enabled = responses.values().all(|r| r.rebalancing_enabled);
        self.inner
            .services
            .global_rebalancing
            .store(rebalancing_enabled, Ordering::SeqCst);

        let mut per_cache: HashMap<String, HashMap<NodeId, CacheStatusResponse>> = HashMap::new();
        for (node, response) in responses {
            for (cache_name, status) in response.caches {
                self.inner
                    .services
                    .identity
                    .add_persistent_address_mapping(node.clone(), status.join_info.persistent_id);
                per_cache
                    .entry(cache_name)
                    .or_default()
                    .insert(node.clone(), status);
            }
        }
        tracing::info!(
            "Recovering {} cache(s) from {} member(s) in view {}",
            per_cache.len(),
            view.members.len(),
            view.view_id
        );

        let tasks = per_cache.into_iter().map(|(cache_name, statuses)| async move {
            let _permit = self.inner.cache_tasks.acquire().await;
            self.recover_cache(&cache_name, statuses, &view.members).await;
        });
        join_all(tasks).await;
        Ok(())
    }

    async fn recover_cache(
        &self,
        cache_name: &str,
        statuses: HashMap<NodeId, CacheStatusResponse>,
        live_members: &[NodeId],
    ) {
        let mut reporters: Vec<&NodeId> = statuses.keys().collect();
        reporters.sort();
        let Some(join_info) = reporters.first().map(|node| statuses[*node].join_info.clone()) else {
            return;
        };
        let cache = Arc::new(Mutex::new(ClusterCacheStatus::new(
            cache_name,
            join_info,
            self.inner.services.clone(),
            self.retired(cache_name),
        )));
        let mut status = cache.lock().await;
        {
            let mut caches = self.inner.caches.write().await;
            caches.insert(cache_name.to_string(), Arc::clone(&cache));
            self.inner.services.metrics.update_cache_count(caches.len());
        }

        status.merge_statuses(&statuses, live_members);
        let actions = status.take_actions();
        self.execute_actions(cache_name, actions).await;
        if status.is_empty() {
            self.retire_cache(cache_name, &status).await;
        }
    }

    /// Heartbeat every live member some cache expects
    async fn check_liveness(&self, view: &ClusterView) -> bool {
        let caches: Vec<CacheHandle> = self.inner.caches.read().await.values().cloned().collect();
        let mut targets: Vec<NodeId> = Vec::new();
        for cache in caches {
            for member in cache.lock().await.expected_members() {
                if view.contains(&member) && !targets.contains(&member) {
                    targets.push(member);
                }
            }
        }
        if targets.is_empty() {
            return true;
        }

        let message = ControlMessage::new(
            self.inner.local_node.clone(),
            view.view_id,
            ControlCommand::Heartbeat,
        );
        let results = self
            .inner
            .transport
            .invoke_many(&targets, message, self.inner.config.heartbeat_duration())
            .await;
        let mut alive = true;
        for (node, result) in results {
            match result {
                Ok(_) | Err(TopologyError::SuspectedNode { .. }) => {}
                Err(e) => {
                    tracing::warn!("Heartbeat to {} failed: {}", node, e);
                    alive = false;
                }
            }
        }
        alive
    }

    async fn reconcile_caches(&self, view: &ClusterView) {
        let caches: Vec<(String, CacheHandle)> = self
            .inner
            .caches
            .read()
            .await
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect();

        let tasks = caches.into_iter().map(|(cache_name, cache)| async move {
            let _permit = self.inner.cache_tasks.acquire().await;
            let mut status = cache.lock().await;
            if !status.reconcile_members(&view.members) {
                return;
            }
            let actions = status.take_actions();
            self.execute_actions(&cache_name, actions).await;
            if status.is_empty() {
                self.retire_cache(&cache_name, &status).await;
            }
        });
        join_all(tasks).await;
    }
}

/// One GET_STATUS round over `members`. Members that left the view are
/// skipped; any other failure fails the round.
async fn fetch_statuses(
    transport: &dyn Transport,
    members: &[NodeId],
    message: ControlMessage,
    timeout: Duration,
) -> Result<HashMap<NodeId, ManagerStatusResponse>> {
    let mut statuses = HashMap::new();
    for (node, result) in transport.invoke_many(members, message, timeout).await {
        match result.and_then(ControlResponse::into_status) {
            Ok(status) => {
                statuses.insert(node, status);
            }
            Err(TopologyError::SuspectedNode { .. }) => {
                tracing::debug!("{} left before reporting its status", node);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(statuses)
}
