//! In-memory cluster harness shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;

use cache_topology::coordinator::InMemoryStateStore;
use cache_topology::topology::CacheStatusResponse;
use cache_topology::{
    AvailabilityMode, CacheMode, CacheTopology, CacheTopologyHandler, ClusterView, ControlMessage,
    ControlResponse, NodeId, Phase, PhaseConfirmation, Result, ScopedPersistentState, TopologyConfig,
    TopologyError, TopologyNode, Transport,
};

/// Routes messages between the nodes of one test cluster
#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<NodeId, Arc<TopologyNode>>>,
    /// Groups of mutually reachable nodes; everyone is reachable when unset
    partitions: RwLock<Option<Vec<Vec<NodeId>>>>,
}

impl Network {
    fn node(&self, id: &NodeId) -> Option<Arc<TopologyNode>> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        match &*self.partitions.read().unwrap() {
            None => true,
            Some(groups) => groups
                .iter()
                .any(|group| group.contains(from) && group.contains(to)),
        }
    }
}

pub struct NetworkTransport {
    local: NodeId,
    network: Weak<Network>,
}

impl NetworkTransport {
    fn target(&self, target: &NodeId) -> Result<Arc<TopologyNode>> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TopologyError::Transport("network shut down".to_string()))?;
        if !network.reachable(&self.local, target) {
            return Err(TopologyError::SuspectedNode {
                node: target.clone(),
            });
        }
        network.node(target).ok_or_else(|| TopologyError::SuspectedNode {
            node: target.clone(),
        })
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn send(&self, target: &NodeId, message: ControlMessage) -> Result<()> {
        let node = self.target(target)?;
        tokio::spawn(async move {
            node.handle_message(message).await;
        });
        Ok(())
    }

    async fn invoke(
        &self,
        target: &NodeId,
        message: ControlMessage,
        timeout: Duration,
    ) -> Result<ControlResponse> {
        let node = self.target(target)?;
        let name = message.command.name();
        tokio::time::timeout(timeout, node.handle_message(message))
            .await
            .map_err(|_| TopologyError::timeout(format!("{} to {}", name, target)))
    }
}

/// Cache handler recording what the topology service asked of it
#[derive(Default)]
pub struct TestHandler {
    topologies: Mutex<Vec<CacheTopology>>,
    modes: Mutex<Vec<AvailabilityMode>>,
    persisted: Mutex<Option<ScopedPersistentState>>,
    /// Keep rebalance confirmations instead of confirming them
    hold_confirmations: bool,
    held: Mutex<Vec<PhaseConfirmation>>,
}

impl TestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler whose state transfers never finish
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            hold_confirmations: true,
            ..Self::default()
        })
    }

    pub fn topology_ids(&self) -> Vec<u32> {
        self.topologies
            .lock()
            .unwrap()
            .iter()
            .map(|topology| topology.topology_id)
            .collect()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.topologies
            .lock()
            .unwrap()
            .iter()
            .map(|topology| topology.phase)
            .collect()
    }

    pub fn modes(&self) -> Vec<AvailabilityMode> {
        self.modes.lock().unwrap().clone()
    }

    pub fn persisted(&self) -> Option<ScopedPersistentState> {
        self.persisted.lock().unwrap().clone()
    }

    pub fn held_confirmations(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

#[async_trait]
impl CacheTopologyHandler for TestHandler {
    async fn update_consistent_hash(&self, topology: &CacheTopology) {
        self.topologies.lock().unwrap().push(topology.clone());
    }

    async fn rebalance(&self, topology: &CacheTopology, confirmation: PhaseConfirmation) {
        self.topologies.lock().unwrap().push(topology.clone());
        if self.hold_confirmations {
            self.held.lock().unwrap().push(confirmation);
            return;
        }
        confirmation.confirm(None).await.unwrap();
    }

    async fn update_availability_mode(&self, mode: AvailabilityMode) {
        self.modes.lock().unwrap().push(mode);
    }

    async fn persist_state(&self, state: ScopedPersistentState) -> Result<()> {
        *self.persisted.lock().unwrap() = Some(state);
        Ok(())
    }
}

fn node_config(name: &str, index: usize) -> TopologyConfig {
    let mut config = TopologyConfig::default();
    config.node.node_id = name.to_string();
    config.node.persistent_id = Some(format!("{:032x}", index + 1));
    config.coordinator.retry_base_delay_ms = 10;
    config.coordinator.retry_max_delay_ms = 100;
    config.coordinator.status_fetch_timeout_ms = 1000;
    config.member.join_retry_delay_ms = 20;
    config.member.join_timeout_ms = 5000;
    config
}

pub struct TestCluster {
    network: Arc<Network>,
    nodes: HashMap<String, Arc<TopologyNode>>,
    next_view_id: AtomicU64,
}

impl TestCluster {
    /// Nodes named `names`, none of which has installed a view yet
    pub fn new(names: &[&str], state_store: Option<Arc<InMemoryStateStore>>) -> Self {
        let network = Arc::new(Network::default());
        let mut nodes = HashMap::new();
        for (index, name) in names.iter().enumerate() {
            let transport = Arc::new(NetworkTransport {
                local: NodeId::from(*name),
                network: Arc::downgrade(&network),
            });
            let mut builder = TopologyNode::builder(node_config(name, index), transport);
            if let Some(store) = &state_store {
                builder = builder.with_state_store(store.clone());
            }
            let node = Arc::new(builder.build().unwrap());
            network
                .nodes
                .write()
                .unwrap()
                .insert(NodeId::from(*name), Arc::clone(&node));
            nodes.insert(name.to_string(), node);
        }
        Self {
            network,
            nodes,
            next_view_id: AtomicU64::new(1),
        }
    }

    /// Nodes named `names` sharing a first view, the first name coordinating
    pub async fn start(names: &[&str]) -> Self {
        let cluster = Self::new(names, None);
        cluster.install_view(names).await;
        cluster
    }

    pub fn node(&self, name: &str) -> Arc<TopologyNode> {
        Arc::clone(&self.nodes[name])
    }

    pub async fn install_view(&self, members: &[&str]) {
        self.install(members, false).await;
    }

    pub async fn install_merge_view(&self, members: &[&str]) {
        self.install(members, true).await;
    }

    async fn install(&self, members: &[&str], merge: bool) {
        let view_id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<NodeId> = members.iter().map(|m| NodeId::from(*m)).collect();
        let view = if merge {
            ClusterView::merge(view_id, ids)
        } else {
            ClusterView::new(view_id, ids)
        };
        // Coordinator last, so members know the view its requests refer to
        for member in members.iter().rev() {
            self.node(member).install_view(view.clone()).await;
        }
    }

    /// Remove `name` from the network; it no longer sends or answers
    pub fn crash(&self, name: &str) {
        self.network
            .nodes
            .write()
            .unwrap()
            .remove(&NodeId::from(name));
    }

    pub fn partition(&self, groups: &[&[&str]]) {
        let groups = groups
            .iter()
            .map(|group| group.iter().map(|m| NodeId::from(*m)).collect())
            .collect();
        *self.network.partitions.write().unwrap() = Some(groups);
    }

    pub fn heal(&self) {
        *self.network.partitions.write().unwrap() = None;
    }

    pub async fn join(
        &self,
        name: &str,
        cache_name: &str,
        handler: Arc<TestHandler>,
    ) -> Result<CacheStatusResponse> {
        self.join_with_mode(name, cache_name, CacheMode::Distributed, handler).await
    }

    pub async fn join_with_mode(
        &self,
        name: &str,
        cache_name: &str,
        cache_mode: CacheMode,
        handler: Arc<TestHandler>,
    ) -> Result<CacheStatusResponse> {
        let node = self.node(name);
        let join_info = node.join_info(cache_mode, 16, 2);
        node.join(cache_name, join_info, handler).await
    }

    /// Wait until every node of `members` runs `cache_name` with a stable
    /// topology owned by exactly `members`, returning that topology
    pub async fn settled(&self, cache_name: &str, members: &[&str]) -> CacheTopology {
        let mut expected: Vec<NodeId> = members.iter().map(|m| NodeId::from(*m)).collect();
        expected.sort();
        let what = format!("cache {} settled on {:?}", cache_name, members);
        eventually(&what, || async {
            let mut seen: Option<u32> = None;
            for member in members {
                let Some(topology) = self.node(member).member().cache_topology(cache_name).await else {
                    return false;
                };
                let mut owners = topology.current_ch.members().to_vec();
                owners.sort();
                if topology.is_rebalance_in_progress() || owners != expected {
                    return false;
                }
                if seen.map_or(false, |id| id != topology.topology_id) {
                    return false;
                }
                seen = Some(topology.topology_id);
            }
            true
        })
        .await;
        self.node(members[0])
            .member()
            .cache_topology(cache_name)
            .await
            .unwrap()
    }
}

/// Poll `check` until it holds, panicking after a few seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
