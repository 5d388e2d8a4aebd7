//! Cluster event log
//!
//! A bounded, timestamped history of topology decisions taken by the
//! coordinator, kept for operators and exported as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEventKind {
    MemberJoined,
    MemberLeft,
    MembershipUpdated,
    RebalanceStarted,
    RebalancePhaseAdvanced,
    RebalanceFinished,
    AvailabilityChanged,
    ConflictResolutionStarted,
    ConflictResolutionFinished,
    ConflictResolutionCancelled,
    PartitionMerged,
    StateRestored,
    CacheShutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub timestamp: DateTime<Utc>,
    pub cache_name: Option<String>,
    pub kind: ClusterEventKind,
    pub message: String,
}

#[derive(Debug)]
pub struct ClusterEventLog {
    capacity: usize,
    events: Mutex<VecDeque<ClusterEvent>>,
}

impl ClusterEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an event, evicting the oldest one when full
    pub fn record(&self, cache_name: Option<&str>, kind: ClusterEventKind, message: impl Into<String>) {
        let event = ClusterEvent {
            timestamp: Utc::now(),
            cache_name: cache_name.map(str::to_string),
            kind,
            message: message.into(),
        };
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().cloned().collect()
    }

    pub fn events_for(&self, cache_name: &str) -> Vec<ClusterEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .filter(|e| e.cache_name.as_deref() == Some(cache_name))
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: ClusterEventKind) -> usize {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.iter().filter(|e| e.kind == kind).count()
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.events())
    }
}

impl Default for ClusterEventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_history() {
        let log = ClusterEventLog::new(2);
        log.record(Some("a"), ClusterEventKind::MemberJoined, "n1 joined");
        log.record(Some("a"), ClusterEventKind::RebalanceStarted, "rebalance 2");
        log.record(Some("b"), ClusterEventKind::MemberJoined, "n2 joined");

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ClusterEventKind::RebalanceStarted);
        assert_eq!(log.events_for("b").len(), 1);
        assert_eq!(log.count(ClusterEventKind::MemberJoined), 1);
    }

    #[test]
    fn test_export_json() {
        let log = ClusterEventLog::default();
        log.record(None, ClusterEventKind::PartitionMerged, "merged 2 partitions");
        let json = log.export_json().unwrap();
        assert!(json.contains("PartitionMerged"));
        assert!(json.contains("merged 2 partitions"));
    }
}
