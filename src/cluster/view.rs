//! Membership views and waiting for them

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Result, TopologyError};
use crate::topology::{NodeId, ViewId};

/// Snapshot of the reachable members delivered by the membership service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub view_id: ViewId,
    /// Ordered members; the first one is the coordinator
    pub members: Vec<NodeId>,
    /// Whether this view merges previously disjoint partitions
    pub is_merge: bool,
}

impl ClusterView {
    pub fn new(view_id: ViewId, members: Vec<NodeId>) -> Self {
        Self {
            view_id,
            members,
            is_merge: false,
        }
    }

    pub fn merge(view_id: ViewId, members: Vec<NodeId>) -> Self {
        Self {
            view_id,
            members,
            is_merge: true,
        }
    }

    pub fn coordinator(&self) -> Option<&NodeId> {
        self.members.first()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}

/// Latest installed view, shared by both topology services of a node
#[derive(Debug, Clone)]
pub struct ViewTracker {
    tx: Arc<watch::Sender<Option<ClusterView>>>,
}

impl ViewTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Install `view` if it is newer than the current one
    pub fn install(&self, view: ClusterView) -> bool {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.view_id >= view.view_id => false,
            _ => {
                *current = Some(view);
                true
            }
        })
    }

    pub fn current(&self) -> Option<ClusterView> {
        self.tx.borrow().clone()
    }

    pub fn current_view_id(&self) -> Option<ViewId> {
        self.tx.borrow().as_ref().map(|view| view.view_id)
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.tx
            .borrow()
            .as_ref()
            .and_then(|view| view.coordinator().cloned())
    }

    /// Wait until a view with at least `view_id` is installed
    pub async fn wait_for_view(&self, view_id: ViewId, timeout: Duration) -> Result<ClusterView> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|view| view.as_ref().map_or(false, |v| v.view_id >= view_id)),
        )
        .await;

        match waited {
            Ok(Ok(installed)) => {
                let view: Option<ClusterView> = (*installed).clone();
                view.ok_or_else(|| TopologyError::Internal("view disappeared".to_string()))
            }
            Ok(Err(_)) => Err(TopologyError::IllegalLifecycleState(
                "view tracker closed".to_string(),
            )),
            Err(_) => Err(TopologyError::timeout(format!("view {}", view_id))),
        }
    }

    /// Resolve once a view newer than `view_id` is installed
    pub async fn wait_for_newer_view(&self, view_id: ViewId) {
        let mut rx = self.tx.subscribe();
        let _ = rx
            .wait_for(|view| view.as_ref().map_or(false, |v| v.view_id > view_id))
            .await;
    }
}

impl Default for ViewTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: ViewId, members: &[&str]) -> ClusterView {
        ClusterView::new(id, members.iter().map(|m| NodeId::from(*m)).collect())
    }

    #[test]
    fn test_older_views_are_ignored() {
        let tracker = ViewTracker::new();
        assert!(tracker.install(view(2, &["a", "b"])));
        assert!(!tracker.install(view(1, &["b"])));
        assert_eq!(tracker.current_view_id(), Some(2));
        assert_eq!(tracker.coordinator(), Some(NodeId::from("a")));
    }

    #[tokio::test]
    async fn test_wait_for_view_released_by_newer_view() {
        let tracker = ViewTracker::new();
        tracker.install(view(1, &["a"]));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_view(3, Duration::from_secs(5)).await })
        };
        tracker.install(view(4, &["a", "b"]));

        let installed = waiter.await.unwrap().unwrap();
        assert_eq!(installed.view_id, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_view_times_out() {
        let tracker = ViewTracker::new();
        tracker.install(view(1, &["a"]));
        let err = tracker
            .wait_for_view(2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::Timeout { .. }));
    }
}
