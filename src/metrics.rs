//! Metrics collection for the topology services
//!
//! Counters are kept locally as atomics for snapshots and mirrored to the
//! `metrics` facade, which a Prometheus exporter can publish.

use crate::config::MetricsConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Topology metrics collector
#[derive(Debug, Default)]
pub struct TopologyMetrics {
    joins: AtomicU64,
    joins_rejected: AtomicU64,
    leaves: AtomicU64,
    topology_updates_sent: AtomicU64,
    topology_updates_applied: AtomicU64,
    stale_updates: AtomicU64,
    rebalances_started: AtomicU64,
    rebalances_completed: AtomicU64,
    phase_confirmations: AtomicU64,
    recoveries: AtomicU64,
    recovery_failures: AtomicU64,
    conflict_resolutions: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub joins: u64,
    pub joins_rejected: u64,
    pub leaves: u64,
    pub topology_updates_sent: u64,
    pub topology_updates_applied: u64,
    pub stale_updates: u64,
    pub rebalances_started: u64,
    pub rebalances_completed: u64,
    pub phase_confirmations: u64,
    pub recoveries: u64,
    pub recovery_failures: u64,
    pub conflict_resolutions: u64,
}

impl TopologyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join request handled by the coordinator
    pub fn record_join(&self, cache_name: &str, accepted: bool) {
        if accepted {
            self.joins.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("topology_joins_total", 1, "cache" => cache_name.to_string());
        } else {
            self.joins_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("topology_joins_rejected_total", 1, "cache" => cache_name.to_string());
        }
    }

    pub fn record_leave(&self, cache_name: &str) {
        self.leaves.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_leaves_total", 1, "cache" => cache_name.to_string());
    }

    /// Record a topology broadcast by the coordinator
    pub fn record_topology_broadcast(&self, cache_name: &str, topology_id: u32) {
        self.topology_updates_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_updates_sent_total", 1, "cache" => cache_name.to_string());
        metrics::gauge!("topology_current_id", topology_id as f64, "cache" => cache_name.to_string());
    }

    /// Record a topology applied on a member
    pub fn record_topology_applied(&self, cache_name: &str) {
        self.topology_updates_applied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_updates_applied_total", 1, "cache" => cache_name.to_string());
    }

    pub fn record_stale_update(&self, cache_name: &str) {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_stale_updates_total", 1, "cache" => cache_name.to_string());
    }

    pub fn record_rebalance_started(&self, cache_name: &str) {
        self.rebalances_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_rebalances_started_total", 1, "cache" => cache_name.to_string());
    }

    pub fn record_rebalance_completed(&self, cache_name: &str) {
        self.rebalances_completed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_rebalances_completed_total", 1, "cache" => cache_name.to_string());
    }

    pub fn record_phase_confirmation(&self, cache_name: &str) {
        self.phase_confirmations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_phase_confirmations_total", 1, "cache" => cache_name.to_string());
    }

    /// Record the outcome of a cluster status recovery
    pub fn record_recovery(&self, success: bool, duration: Duration) {
        if success {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("topology_recoveries_total", 1);
        } else {
            self.recovery_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("topology_recovery_failures_total", 1);
        }
        metrics::histogram!("topology_recovery_duration_ms", duration.as_millis() as f64);
    }

    pub fn record_conflict_resolution(&self, cache_name: &str) {
        self.conflict_resolutions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_conflict_resolutions_total", 1, "cache" => cache_name.to_string());
    }

    /// Update the number of caches managed by the coordinator
    pub fn update_cache_count(&self, count: usize) {
        metrics::gauge!("topology_managed_caches", count as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            joins: self.joins.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            leaves: self.leaves.load(Ordering::Relaxed),
            topology_updates_sent: self.topology_updates_sent.load(Ordering::Relaxed),
            topology_updates_applied: self.topology_updates_applied.load(Ordering::Relaxed),
            stale_updates: self.stale_updates.load(Ordering::Relaxed),
            rebalances_started: self.rebalances_started.load(Ordering::Relaxed),
            rebalances_completed: self.rebalances_completed.load(Ordering::Relaxed),
            phase_confirmations: self.phase_confirmations.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            conflict_resolutions: self.conflict_resolutions.load(Ordering::Relaxed),
        }
    }
}

/// Install the Prometheus exporter when enabled in configuration.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus_exporter(config: &MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.enabled || !config.prometheus {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.labels {
        builder = builder.add_global_label(key.clone(), value.clone());
    }
    builder.install()?;

    tracing::info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let metrics = TopologyMetrics::new();
        metrics.record_join("users", true);
        metrics.record_join("users", false);
        metrics.record_rebalance_started("users");
        metrics.record_recovery(false, Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.joins, 1);
        assert_eq!(snapshot.joins_rejected, 1);
        assert_eq!(snapshot.rebalances_started, 1);
        assert_eq!(snapshot.recovery_failures, 1);
        assert_eq!(snapshot.recoveries, 0);
    }

    #[test]
    fn test_disabled_exporter_is_noop() {
        let config = MetricsConfig::default();
        assert!(install_prometheus_exporter(&config).is_ok());
    }
}
