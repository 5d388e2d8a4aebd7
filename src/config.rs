//! Configuration management for the topology services
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde for serialization and deserialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for a topology node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Local node configuration
    pub node: NodeConfig,
    /// Coordinator-side configuration
    pub coordinator: CoordinatorConfig,
    /// Member-side configuration
    pub member: MemberConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Transient network address of this node
    pub node_id: String,
    /// Restart-stable identity, hex encoded; generated when absent
    pub persistent_id: Option<String>,
    /// Capacity factor advertised when joining caches
    pub capacity_factor: f32,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Whether rebalancing is enabled cluster-wide at startup
    pub rebalancing_enabled: bool,
    /// Timeout of one cluster status request in milliseconds
    pub status_fetch_timeout_ms: u64,
    /// Attempts made to collect cluster status after becoming coordinator
    pub status_fetch_attempts: u32,
    /// Timeout of the liveness heartbeat in milliseconds
    pub heartbeat_timeout_ms: u64,
    /// Caches processed concurrently during recovery and view changes
    pub max_concurrent_cache_tasks: usize,
    /// Base delay between retries in milliseconds
    pub retry_base_delay_ms: u64,
    /// Upper bound for the retry delay in milliseconds
    pub retry_max_delay_ms: u64,
    /// Time to wait for a view referenced by a request, in milliseconds
    pub view_wait_timeout_ms: u64,
    /// Capacity of the cluster event log
    pub event_log_capacity: usize,
}

/// Member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Default join timeout in milliseconds
    pub join_timeout_ms: u64,
    /// Delay between join attempts in milliseconds
    pub join_retry_delay_ms: u64,
    /// Time to wait for a view referenced by an update, in milliseconds
    pub view_wait_timeout_ms: u64,
    /// Timeout of request/response calls to the coordinator in milliseconds
    pub request_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Directory for rolling log files (optional)
    pub directory: Option<String>,
    /// Log file name prefix
    pub file_prefix: String,
    /// Rotation of log files
    pub rotation: LogRotationInterval,
    /// Enable console output
    pub console: bool,
}

/// Log level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Log rotation interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogRotationInterval {
    Daily,
    Hourly,
    Never,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics
    pub enabled: bool,
    /// Enable the Prometheus exporter
    pub prometheus: bool,
    /// Metrics bind address
    pub bind_address: String,
    /// Metrics port
    pub port: u16,
    /// Custom labels
    pub labels: HashMap<String, String>,
}

impl TopologyConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: TopologyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: TopologyConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.node_id.is_empty() {
            errors.push("Node ID cannot be empty".to_string());
        }
        if self.node.capacity_factor < 0.0 {
            errors.push("Capacity factor cannot be negative".to_string());
        }
        if let Some(persistent_id) = &self.node.persistent_id {
            if persistent_id.parse::<crate::topology::PersistentId>().is_err() {
                errors.push("Persistent ID must be 32 hex characters".to_string());
            }
        }

        if self.coordinator.status_fetch_attempts == 0 {
            errors.push("Status fetch attempts cannot be 0".to_string());
        }
        if self.coordinator.status_fetch_timeout_ms == 0 {
            errors.push("Status fetch timeout cannot be 0".to_string());
        }
        if self.coordinator.max_concurrent_cache_tasks == 0 {
            errors.push("Max concurrent cache tasks cannot be 0".to_string());
        }
        if self.coordinator.retry_base_delay_ms > self.coordinator.retry_max_delay_ms {
            errors.push("Retry base delay cannot exceed retry max delay".to_string());
        }
        if self.coordinator.event_log_capacity == 0 {
            errors.push("Event log capacity cannot be 0".to_string());
        }

        if self.member.join_timeout_ms == 0 {
            errors.push("Join timeout cannot be 0".to_string());
        }
        if self.member.request_timeout_ms == 0 {
            errors.push("Request timeout cannot be 0".to_string());
        }

        if self.metrics.enabled && self.metrics.prometheus && self.metrics.port == 0 {
            errors.push("Metrics port cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl CoordinatorConfig {
    /// Get duration for one cluster status request
    pub fn status_fetch_duration(&self) -> Duration {
        Duration::from_millis(self.status_fetch_timeout_ms)
    }

    /// Get duration for the liveness heartbeat
    pub fn heartbeat_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn view_wait_duration(&self) -> Duration {
        Duration::from_millis(self.view_wait_timeout_ms)
    }
}

impl MemberConfig {
    /// Get duration for the default join timeout
    pub fn join_duration(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Get duration between join attempts
    pub fn join_retry_duration(&self) -> Duration {
        Duration::from_millis(self.join_retry_delay_ms)
    }

    /// Get duration for member requests to the coordinator
    pub fn request_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn view_wait_duration(&self) -> Duration {
        Duration::from_millis(self.view_wait_timeout_ms)
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            coordinator: CoordinatorConfig::default(),
            member: MemberConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            persistent_id: None,
            capacity_factor: 1.0,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rebalancing_enabled: true,
            status_fetch_timeout_ms: 2000,
            status_fetch_attempts: 3,
            heartbeat_timeout_ms: 1000,
            max_concurrent_cache_tasks: 4,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1000,
            view_wait_timeout_ms: 5000,
            event_log_capacity: 1024,
        }
    }
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            join_retry_delay_ms: 100,
            view_wait_timeout_ms: 5000,
            request_timeout_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            directory: None,
            file_prefix: "topology.log".to_string(),
            rotation: LogRotationInterval::Daily,
            console: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus: false,
            bind_address: "127.0.0.1".to_string(),
            port: 9100,
            labels: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TopologyConfig::default();
        assert_eq!(config.node.node_id, "node-1");
        assert!(config.coordinator.rebalancing_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TopologyConfig::default();
        config.coordinator.status_fetch_attempts = 0;
        config.node.persistent_id = Some("not-hex".to_string());
        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Status fetch attempts cannot be 0".to_string()));
        assert!(errors.contains(&"Persistent ID must be 32 hex characters".to_string()));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("topology.toml");
        let yaml_path = dir.path().join("topology.yaml");

        let mut config = TopologyConfig::default();
        config.node.node_id = "node-7".to_string();
        config.member.join_timeout_ms = 1234;

        config.save_to_file(&toml_path).unwrap();
        config.save_to_yaml_file(&yaml_path).unwrap();

        let from_toml = TopologyConfig::from_file(&toml_path).unwrap();
        let from_yaml = TopologyConfig::from_yaml_file(&yaml_path).unwrap();
        assert_eq!(from_toml.node.node_id, "node-7");
        assert_eq!(from_yaml.member.join_timeout_ms, 1234);
    }

    #[test]
    fn test_duration_conversions() {
        let config = TopologyConfig::default();
        assert_eq!(config.member.join_duration(), Duration::from_secs(10));
        assert_eq!(config.coordinator.status_fetch_duration(), Duration::from_secs(2));
        assert_eq!(config.coordinator.view_wait_duration(), Duration::from_secs(5));
    }
}
