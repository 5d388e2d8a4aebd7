pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod log;
pub mod member;
pub mod metrics;
pub mod node;
pub mod partition;
pub mod protocol;
pub mod rebalancing;
pub mod retry;
pub mod topology;

pub use cluster::{ClusterView, Transport, ViewTracker};
pub use config::TopologyConfig;
pub use coordinator::{
    ClusterCacheStatus, ClusterManagerStatus, ClusterTopologyManager, ConflictResolver,
    InMemoryStateStore, PersistentStateStore,
};
pub use error::{Result, TopologyError};
pub use events::{ClusterEvent, ClusterEventKind, ClusterEventLog};
pub use member::{CacheTopologyHandler, LocalTopologyManager, PhaseConfirmation};
pub use metrics::TopologyMetrics;
pub use node::{TopologyNode, TopologyNodeBuilder};
pub use protocol::{ControlCommand, ControlMessage, ControlResponse};
pub use topology::{
    AvailabilityMode, CacheJoinInfo, CacheMode, CacheTopology, ConsistentHash,
    ConsistentHashFactory, NodeId, PartitionHandling, PersistentId, Phase,
    RingConsistentHashFactory, ScopedPersistentState,
};
