//! Cluster data model
//!
//! Node definitions, cluster state, metrics samples and partition snapshots

mod metrics;
mod node;
mod partition;
mod state;

pub use metrics::{
    ClusterMetrics, ConnectionStatus, ErrorCounters, MemoryStats, NodeMetrics, ThroughputStats,
};
pub use node::{NodeHealth, NodeId, NodeSpec};
pub use partition::{slot_for_key, PartitionInfo, SlotRange, TOTAL_SLOTS};
pub use state::ClusterState;
