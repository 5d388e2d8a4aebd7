//! Structured logging for the topology services
//!
//! Logging goes through the `tracing` crate. The subscriber writes to the
//! console or to rolling files through `tracing-appender`.

use crate::config::{LogFormat, LogLevel, LogRotationInterval, LoggingConfig};
use crate::topology::{AvailabilityMode, CacheTopology};
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{time::UtcTime, writer::BoxMakeWriter};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system based on configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let writer = match &config.directory {
        Some(directory) => {
            let appender = match config.rotation {
                LogRotationInterval::Daily => {
                    tracing_appender::rolling::daily(directory, &config.file_prefix)
                }
                LogRotationInterval::Hourly => {
                    tracing_appender::rolling::hourly(directory, &config.file_prefix)
                }
                LogRotationInterval::Never => {
                    tracing_appender::rolling::never(directory, &config.file_prefix)
                }
            };
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            BoxMakeWriter::new(non_blocking)
        }
        None if config.console => BoxMakeWriter::new(std::io::stdout),
        None => BoxMakeWriter::new(std::io::sink),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_timer(UtcTime::rfc_3339());

    let installed = match config.format {
        LogFormat::Json => builder.json().with_writer(writer).try_init(),
        LogFormat::Pretty => builder.pretty().with_writer(writer).try_init(),
        LogFormat::Simple => builder.with_writer(writer).try_init(),
    };
    installed.map_err(|e| e.to_string())?;

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Log a cluster operation with structured fields
pub fn log_cluster_operation(
    operation: &str,
    node_id: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let extra = additional_fields
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ");

    let span = tracing::info_span!(
        "cluster_operation",
        operation = operation,
        node_id = node_id,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::info!(extra = %extra, "Cluster operation completed successfully");
    } else {
        tracing::error!(extra = %extra, "Cluster operation failed");
    }
}

/// Log the installation of a new topology for a cache
pub fn log_topology_update(
    cache_name: &str,
    topology: &CacheTopology,
    availability_mode: AvailabilityMode,
) {
    tracing::info!(
        cache = cache_name,
        topology_id = topology.topology_id,
        rebalance_id = topology.rebalance_id,
        phase = ?topology.phase,
        members = ?topology.members(),
        availability = ?availability_mode,
        "Installed cache topology"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig {
            console: false,
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
        log_cluster_operation(
            "join",
            "node-1",
            true,
            Duration::from_millis(3),
            Some(vec![("cache", "users".to_string())]),
        );
    }

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(&LogLevel::Debug), "debug");
        assert_eq!(level_directive(&LogLevel::Error), "error");
    }
}
