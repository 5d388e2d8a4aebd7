//! Conflict resolution hook invoked after a partition merge

use async_trait::async_trait;

use crate::error::Result;
use crate::topology::CacheTopology;

/// Reconciles the divergent copies left behind by a partition merge.
///
/// Called by the coordinator with the `ConflictResolution` topology, whose
/// ownership is the union of every partition's read ownership. Rebalancing
/// of the cache is postponed until the call returns.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve_conflicts(&self, cache_name: &str, topology: &CacheTopology) -> Result<()>;
}

/// Resolver for deployments where the data layer repairs itself
#[derive(Debug, Default, Clone)]
pub struct NoopConflictResolver;

#[async_trait]
impl ConflictResolver for NoopConflictResolver {
    async fn resolve_conflicts(&self, cache_name: &str, topology: &CacheTopology) -> Result<()> {
        tracing::debug!(
            "No conflict resolver configured for cache {}, accepting topology {}",
            cache_name,
            topology.topology_id
        );
        Ok(())
    }
}
