//! Barrier closing one rebalance phase

use std::collections::HashSet;
use tokio::sync::oneshot;

use crate::error::{Result, TopologyError};
use crate::topology::{NodeId, TopologyId};

/// Tracks which members still have to confirm a topology.
///
/// Completion is reported exactly once: by the `Ok(true)` of the call that
/// empties the pending set, and through the optional completion channel.
/// Callers serialize access through the per-cache lock.
#[derive(Debug)]
pub struct RebalanceConfirmationCollector {
    cache_name: String,
    topology_id: TopologyId,
    pending: HashSet<NodeId>,
    completed: bool,
    completion_tx: Option<oneshot::Sender<TopologyId>>,
}

impl RebalanceConfirmationCollector {
    pub fn new(
        cache_name: impl Into<String>,
        topology_id: TopologyId,
        members: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let cache_name = cache_name.into();
        let pending: HashSet<NodeId> = members.into_iter().collect();
        tracing::debug!(
            "Created confirmation collector for cache {} topology {} waiting on {:?}",
            cache_name,
            topology_id,
            pending
        );
        Self {
            cache_name,
            topology_id,
            pending,
            completed: false,
            completion_tx: None,
        }
    }

    /// Channel resolved with the topology id once the barrier completes
    pub fn completion(&mut self) -> oneshot::Receiver<TopologyId> {
        let (tx, rx) = oneshot::channel();
        if self.completed {
            let _ = tx.send(self.topology_id);
        } else {
            self.completion_tx = Some(tx);
        }
        rx
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Members that have not confirmed yet, sorted
    pub fn pending(&self) -> Vec<NodeId> {
        let mut pending: Vec<NodeId> = self.pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    /// Record a confirmation for `observed_topology_id`.
    ///
    /// Returns `Ok(true)` only for the call that completes the barrier. A
    /// confirmation for an older topology is rejected and leaves the member
    /// pending.
    pub fn confirm(&mut self, member: &NodeId, observed_topology_id: TopologyId) -> Result<bool> {
        if observed_topology_id < self.topology_id {
            return Err(TopologyError::StaleUpdate {
                cache_name: self.cache_name.clone(),
                received: observed_topology_id,
                current: self.topology_id,
            });
        }
        if self.completed {
            return Ok(false);
        }
        if !self.pending.remove(member) {
            tracing::debug!(
                "Ignoring confirmation from {} for cache {}: not pending",
                member,
                self.cache_name
            );
        }
        Ok(self.try_complete())
    }

    /// Drop pending members that are no longer alive
    pub fn update_members(&mut self, live_members: &[NodeId]) -> bool {
        if self.completed {
            return false;
        }
        self.pending.retain(|member| live_members.contains(member));
        self.try_complete()
    }

    fn try_complete(&mut self) -> bool {
        if self.completed || !self.pending.is_empty() {
            return false;
        }
        self.completed = true;
        tracing::debug!(
            "All members confirmed topology {} of cache {}",
            self.topology_id,
            self.cache_name
        );
        if let Some(tx) = self.completion_tx.take() {
            let _ = tx.send(self.topology_id);
        }
        true
    }
}
