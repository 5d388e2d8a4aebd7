//! Member-side topology service
//!
//! Every node runs a `LocalTopologyManager`. It joins caches through the
//! coordinator, applies the topologies the coordinator broadcasts in
//! topology order, confirms rebalance phases and answers the coordinator's
//! status queries.

pub mod cache_status;

pub use cache_status::{persistent_state_of, CacheTopologyHandler, LocalCacheStatus, PhaseConfirmation};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::cluster::{Transport, ViewTracker};
use crate::config::MemberConfig;
use crate::error::{Result, TopologyError};
use crate::log::{log_cluster_operation, log_topology_update};
use crate::metrics::TopologyMetrics;
use crate::protocol::{ControlCommand, ControlMessage, ControlResponse, TopologyUpdateKind};
use crate::retry::{retry, RetryPolicy};
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ConsistentHashFactory,
    ManagerStatusResponse, NodeId, ViewId,
};

type LocalCacheHandle = Arc<Mutex<LocalCacheStatus>>;

#[derive(Clone)]
pub struct LocalTopologyManager {
    inner: Arc<MemberInner>,
}

struct MemberInner {
    local_node: NodeId,
    config: MemberConfig,
    transport: Arc<dyn Transport>,
    views: ViewTracker,
    factory: Arc<dyn ConsistentHashFactory>,
    metrics: Arc<TopologyMetrics>,
    caches: RwLock<HashMap<String, LocalCacheHandle>>,
    /// View id of the last status query answered; older senders are stale
    last_status_view: AtomicU64,
    /// Cluster-wide rebalancing flag, mirrored from the coordinator
    rebalancing_enabled: AtomicBool,
    running: AtomicBool,
}

impl LocalTopologyManager {
    pub fn new(
        config: MemberConfig,
        transport: Arc<dyn Transport>,
        views: ViewTracker,
        factory: Arc<dyn ConsistentHashFactory>,
        metrics: Arc<TopologyMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(MemberInner {
                local_node: transport.local_node().clone(),
                config,
                transport,
                views,
                factory,
                metrics,
                caches: RwLock::new(HashMap::new()),
                last_status_view: AtomicU64::new(0),
                rebalancing_enabled: AtomicBool::new(true),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local_node
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TopologyError::IllegalLifecycleState(format!(
                "topology service on {} is stopped",
                self.inner.local_node
            )));
        }
        Ok(())
    }

    async fn cache(&self, cache_name: &str) -> Option<LocalCacheHandle> {
        self.inner.caches.read().await.get(cache_name).cloned()
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn cache_topology(&self, cache_name: &str) -> Option<CacheTopology> {
        let cache = self.cache(cache_name).await?;
        let status = cache.lock().await;
        status.current_topology().cloned()
    }

    pub async fn stable_topology(&self, cache_name: &str) -> Option<CacheTopology> {
        let cache = self.cache(cache_name).await?;
        let status = cache.lock().await;
        status.stable_topology().cloned()
    }

    pub async fn availability_mode(&self, cache_name: &str) -> Option<AvailabilityMode> {
        let cache = self.cache(cache_name).await?;
        let status = cache.lock().await;
        Some(status.availability_mode())
    }

    /// Last cluster-wide rebalancing flag received from a coordinator
    pub fn is_cluster_rebalancing_enabled(&self) -> bool {
        self.inner.rebalancing_enabled.load(Ordering::SeqCst)
    }

    /// Join `cache_name`, returning the coordinator's answer once the
    /// topology it carries has been installed locally
    pub async fn join(
        &self,
        cache_name: &str,
        join_info: CacheJoinInfo,
        handler: Arc<dyn CacheTopologyHandler>,
    ) -> Result<CacheStatusResponse> {
        self.ensure_running()?;
        let started = Instant::now();
        let cache = Arc::new(Mutex::new(LocalCacheStatus::new(join_info.clone(), handler)));
        {
            // Registered before sending so updates racing the response are kept
            let mut caches = self.inner.caches.write().await;
            if caches.contains_key(cache_name) {
                return Err(TopologyError::IllegalLifecycleState(format!(
                    "cache {} is already running on {}",
                    cache_name, self.inner.local_node
                )));
            }
            caches.insert(cache_name.to_string(), Arc::clone(&cache));
        }

        let result = self.send_join(cache_name, &join_info).await;
        log_cluster_operation(
            "join",
            self.inner.local_node.as_str(),
            result.is_ok(),
            started.elapsed(),
            Some(vec![("cache", cache_name.to_string())]),
        );
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Join of cache {} failed: {}", cache_name, e);
                self.unregister(cache_name, &cache).await;
                return Err(e);
            }
        };

        let mut status = cache.lock().await;
        if let Some(stable) = &response.stable_topology {
            Self::apply_stable_topology(&mut status, stable.clone());
        }
        match response.current_topology.clone() {
            Some(topology) if topology.topology_id > status.last_topology_id() => {
                self.apply_topology(cache_name, &mut status, topology, response.availability_mode)
                    .await;
            }
            Some(_) => {
                tracing::debug!(
                    "Cache {} already applied a newer topology than the join response",
                    cache_name
                );
            }
            None => {
                status.availability_mode = response.availability_mode;
            }
        }
        Ok(response)
    }

    /// Send the join to the coordinator until it answers or the cache's join
    /// timeout expires. A newer view abandons the pending request and resends
    /// right away, since the coordinator may have changed.
    async fn send_join(&self, cache_name: &str, join_info: &CacheJoinInfo) -> Result<CacheStatusResponse> {
        let config = &self.inner.config;
        let deadline = tokio::time::Instant::now() + join_info.timeout();
        let policy = RetryPolicy::new(
            u32::MAX,
            config.join_retry_duration(),
            config.join_retry_duration().saturating_mul(8),
        )
        .with_deadline(deadline);

        retry(&policy, "join", |attempt| async move {
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let view = self
                    .inner
                    .views
                    .current()
                    .ok_or_else(|| TopologyError::timeout("first membership view"))?;
                let coordinator = view
                    .coordinator()
                    .cloned()
                    .ok_or_else(|| TopologyError::timeout("coordinator election"))?;
                tracing::debug!(
                    "Join attempt {} for cache {} sent to {} in view {}",
                    attempt,
                    cache_name,
                    coordinator,
                    view.view_id
                );
                let message = ControlMessage::new(
                    self.inner.local_node.clone(),
                    view.view_id,
                    ControlCommand::Join {
                        cache_name: cache_name.to_string(),
                        join_info: join_info.clone(),
                    },
                );
                tokio::select! {
                    response = self.inner.transport.invoke(&coordinator, message, remaining) => {
                        return response?.into_join();
                    }
                    _ = self.inner.views.wait_for_newer_view(view.view_id) => {
                        tracing::debug!(
                            "View changed while joining cache {}, resending the join",
                            cache_name
                        );
                    }
                }
            }
        })
        .await
    }

    async fn unregister(&self, cache_name: &str, cache: &LocalCacheHandle) {
        let mut caches = self.inner.caches.write().await;
        if caches
            .get(cache_name)
            .map_or(false, |registered| Arc::ptr_eq(registered, cache))
        {
            caches.remove(cache_name);
        }
    }

    /// Stop running `cache_name` and tell the coordinator, best-effort
    pub async fn leave(&self, cache_name: &str) -> Result<()> {
        self.ensure_running()?;
        if self.inner.caches.write().await.remove(cache_name).is_none() {
            tracing::debug!("Cache {} is not running, nothing to leave", cache_name);
            return Ok(());
        }
        let Some(view) = self.inner.views.current() else {
            return Ok(());
        };
        let Some(coordinator) = view.coordinator().cloned() else {
            return Ok(());
        };
        let message = ControlMessage::new(
            self.inner.local_node.clone(),
            view.view_id,
            ControlCommand::Leave {
                cache_name: cache_name.to_string(),
            },
        );
        if let Err(e) = self.inner.transport.send(&coordinator, message).await {
            tracing::warn!("Failed to send leave of cache {} to {}: {}", cache_name, coordinator, e);
        }
        Ok(())
    }

    /// Local shutdown; later requests fail and updates are ignored
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.caches.write().await.clear();
        tracing::info!("Topology service on {} stopped", self.inner.local_node);
    }

    /// Find the cache an update from `sender` addresses, if it is acceptable
    async fn accept_update(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        update: &str,
    ) -> Option<LocalCacheHandle> {
        if self.ensure_running().is_err() {
            return None;
        }
        if let Err(e) = self
            .inner
            .views
            .wait_for_view(view_id, self.inner.config.view_wait_duration())
            .await
        {
            tracing::debug!("Dropping {} for cache {}: {}", update, cache_name, e);
            return None;
        }
        let coordinator = self.inner.views.coordinator();
        if coordinator.as_ref() != Some(sender) {
            tracing::debug!(
                "Ignoring {} for cache {} from {}, coordinator is {:?}",
                update,
                cache_name,
                sender,
                coordinator
            );
            return None;
        }
        let last_status_view = self.inner.last_status_view.load(Ordering::SeqCst);
        if view_id < last_status_view {
            tracing::debug!(
                "Ignoring {} for cache {} sent in view {}, status was already reported in view {}",
                update,
                cache_name,
                view_id,
                last_status_view
            );
            return None;
        }
        let cache = self.cache(cache_name).await;
        if cache.is_none() {
            tracing::trace!("Ignoring {} for cache {} not running here", update, cache_name);
        }
        cache
    }

    /// CH_UPDATE, READ_CH_UPDATE or WRITE_CH_UPDATE from the coordinator
    pub async fn handle_topology_update(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        kind: TopologyUpdateKind,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    ) {
        self.handle_update(sender, view_id, cache_name, kind.name(), topology, availability_mode)
            .await;
    }

    /// REBALANCE_START from the coordinator
    pub async fn handle_rebalance_start(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    ) {
        self.handle_update(sender, view_id, cache_name, "REBALANCE_START", topology, availability_mode)
            .await;
    }

    async fn handle_update(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        update: &str,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    ) {
        let Some(cache) = self.accept_update(sender, view_id, cache_name, update).await else {
            return;
        };
        let mut status = cache.lock().await;
        let last = status.last_topology_id();
        if topology.topology_id <= last {
            self.inner.metrics.record_stale_update(cache_name);
            tracing::debug!(
                "Ignoring {} of cache {} with topology {}, already at {}",
                update,
                cache_name,
                topology.topology_id,
                last
            );
            return;
        }
        self.apply_topology(cache_name, &mut status, topology, availability_mode)
            .await;
    }

    /// Install `topology`, restricting availability before the ownership
    /// change and lifting restrictions after it
    async fn apply_topology(
        &self,
        cache_name: &str,
        status: &mut LocalCacheStatus,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    ) {
        let topology = topology.with_union(self.inner.factory.as_ref());
        let starts_transfer = topology.is_rebalance_in_progress()
            && status.current_topology.as_ref().map_or(true, |previous| {
                !previous.is_rebalance_in_progress() || previous.rebalance_id != topology.rebalance_id
            });
        let mode_changed = availability_mode != status.availability_mode;

        if mode_changed && availability_mode.is_restrictive() {
            status.handler.update_availability_mode(availability_mode).await;
            status.availability_mode = availability_mode;
        }

        log_topology_update(cache_name, &topology, availability_mode);
        status.current_topology = Some(topology.clone());
        self.inner.metrics.record_topology_applied(cache_name);
        if starts_transfer {
            let confirmation = PhaseConfirmation::new(
                cache_name,
                topology.topology_id,
                Arc::clone(&self.inner.transport),
                self.inner.views.clone(),
            );
            status.handler.rebalance(&topology, confirmation).await;
        } else {
            status.handler.update_consistent_hash(&topology).await;
        }

        if mode_changed && !availability_mode.is_restrictive() {
            status.handler.update_availability_mode(availability_mode).await;
            status.availability_mode = availability_mode;
        }

        if !starts_transfer && topology.phase.confirms_on_install() {
            let confirmation = PhaseConfirmation::new(
                cache_name,
                topology.topology_id,
                Arc::clone(&self.inner.transport),
                self.inner.views.clone(),
            );
            if let Err(e) = confirmation.confirm(None).await {
                tracing::warn!(
                    "Failed to confirm topology {} of cache {}: {}",
                    topology.topology_id,
                    cache_name,
                    e
                );
            }
        }
    }

    /// STABLE_TOPOLOGY_UPDATE from the coordinator
    pub async fn handle_stable_topology_update(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        topology: CacheTopology,
    ) {
        let Some(cache) = self
            .accept_update(sender, view_id, cache_name, "STABLE_TOPOLOGY_UPDATE")
            .await
        else {
            return;
        };
        let mut status = cache.lock().await;
        Self::apply_stable_topology(&mut status, topology);
    }

    fn apply_stable_topology(status: &mut LocalCacheStatus, topology: CacheTopology) {
        let newer = status
            .stable_topology
            .as_ref()
            .map_or(true, |stable| stable.topology_id < topology.topology_id);
        if newer {
            status.stable_topology = Some(topology);
        }
    }

    /// GET_STATUS: report every cache this node runs
    pub async fn handle_status_request(&self, view_id: ViewId) -> Result<ManagerStatusResponse> {
        self.ensure_running()?;
        self.inner.last_status_view.fetch_max(view_id, Ordering::SeqCst);
        let caches: Vec<(String, LocalCacheHandle)> = self
            .inner
            .caches
            .read()
            .await
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect();

        let mut statuses = HashMap::with_capacity(caches.len());
        for (name, cache) in caches {
            let status = cache.lock().await;
            statuses.insert(name, status.status_response());
        }
        Ok(ManagerStatusResponse {
            caches: statuses,
            rebalancing_enabled: self.is_cluster_rebalancing_enabled(),
        })
    }

    /// REBALANCE_POLICY_UPDATE from the coordinator
    pub fn handle_rebalance_policy_update(&self, enabled: bool) {
        self.inner.rebalancing_enabled.store(enabled, Ordering::SeqCst);
    }

    /// SHUTDOWN_PERFORM: persist the cache's ownership and stop running it
    pub async fn handle_shutdown_perform(
        &self,
        sender: &NodeId,
        view_id: ViewId,
        cache_name: &str,
        topology: Option<CacheTopology>,
    ) -> Result<()> {
        let Some(cache) = self
            .accept_update(sender, view_id, cache_name, "SHUTDOWN_PERFORM")
            .await
        else {
            return Ok(());
        };
        self.unregister(cache_name, &cache).await;
        let status = cache.lock().await;
        let Some(topology) = topology.or_else(|| status.current_topology.clone()) else {
            tracing::info!("Cache {} stopped before receiving a topology", cache_name);
            return Ok(());
        };
        let state = persistent_state_of(cache_name, &topology)?;
        tracing::info!(
            "Persisting state of cache {} at topology {} (checksum {})",
            cache_name,
            state.topology_id,
            state.checksum
        );
        status.handler.persist_state(state).await
    }

    async fn invoke_coordinator(&self, command: ControlCommand) -> Result<ControlResponse> {
        self.ensure_running()?;
        let view = self
            .inner
            .views
            .current()
            .ok_or_else(|| TopologyError::timeout("first membership view"))?;
        let coordinator = view
            .coordinator()
            .cloned()
            .ok_or_else(|| TopologyError::timeout("coordinator election"))?;
        let message = ControlMessage::new(self.inner.local_node.clone(), view.view_id, command);
        self.inner
            .transport
            .invoke(&coordinator, message, self.inner.config.request_duration())
            .await
    }

    /// Ask the coordinator whether rebalancing is enabled
    pub async fn is_rebalancing_enabled(&self, cache_name: Option<&str>) -> Result<bool> {
        self.invoke_coordinator(ControlCommand::PolicyGetStatus {
            cache_name: cache_name.map(str::to_string),
        })
        .await?
        .into_bool()
    }

    pub async fn set_rebalancing_enabled(&self, cache_name: Option<&str>, enabled: bool) -> Result<()> {
        let cache_name = cache_name.map(str::to_string);
        let command = if enabled {
            ControlCommand::PolicyEnable { cache_name }
        } else {
            ControlCommand::PolicyDisable { cache_name }
        };
        self.invoke_coordinator(command).await?.into_bool().map(|_| ())
    }

    pub async fn set_availability_mode(&self, cache_name: &str, mode: AvailabilityMode) -> Result<()> {
        self.invoke_coordinator(ControlCommand::AvailabilityModeChange {
            cache_name: cache_name.to_string(),
            mode,
        })
        .await?
        .into_bool()
        .map(|_| ())
    }

    pub async fn force_rebalance(&self, cache_name: &str) -> Result<()> {
        self.invoke_coordinator(ControlCommand::ForceRebalance {
            cache_name: cache_name.to_string(),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Stop `cache_name` on every member, persisting its ownership
    pub async fn shutdown_cache(&self, cache_name: &str) -> Result<()> {
        self.invoke_coordinator(ControlCommand::ShutdownRequest {
            cache_name: cache_name.to_string(),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Time budget for requests sent to the coordinator
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_duration()
    }
}
