//! Node and cluster metrics samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::NodeId;
use crate::driver::InfoMap;

/// Connection status observed by the last probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Memory snapshot (bytes), from the `memory` INFO section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used: u64,
    /// `maxmemory`, 0 when unlimited
    pub max: u64,
    pub peak: u64,
    pub fragmentation_ratio: f64,
}

/// Throughput snapshot, from the `stats` INFO section
///
/// Rates are from the server's point of view: `read_rate_kbps` is network
/// input, `write_rate_kbps` network output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub ops_per_sec: f64,
    pub read_rate_kbps: f64,
    pub write_rate_kbps: f64,
}

/// Probe error counters, cumulative per node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub connection: u64,
    pub command: u64,
    pub timeout: u64,
    pub cluster: u64,
}

impl ErrorCounters {
    pub fn total(&self) -> u64 {
        self.connection + self.command + self.timeout + self.cluster
    }

    pub(crate) fn add(&mut self, other: &ErrorCounters) {
        self.connection += other.connection;
        self.command += other.command;
        self.timeout += other.timeout;
        self.cluster += other.cluster;
    }
}

/// Latest sample for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: NodeId,
    pub status: ConnectionStatus,
    /// Round trip of the connectivity probe
    pub latency_ms: f64,
    pub memory: MemoryStats,
    pub throughput: ThroughputStats,
    pub errors: ErrorCounters,
    pub connected_clients: u64,
    /// `master` / `slave`, when reported
    pub role: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

impl NodeMetrics {
    /// Build a sample from a parsed `INFO` reply
    pub fn from_info(node_id: &str, info: &InfoMap, latency: Duration) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: ConnectionStatus::Connected,
            latency_ms: latency.as_secs_f64() * 1000.0,
            memory: MemoryStats {
                used: info.get_u64("used_memory").unwrap_or(0),
                max: info.get_u64("maxmemory").unwrap_or(0),
                peak: info.get_u64("used_memory_peak").unwrap_or(0),
                fragmentation_ratio: info.get_f64("mem_fragmentation_ratio").unwrap_or(0.0),
            },
            throughput: ThroughputStats {
                ops_per_sec: info.get_f64("instantaneous_ops_per_sec").unwrap_or(0.0),
                read_rate_kbps: info.get_f64("instantaneous_input_kbps").unwrap_or(0.0),
                write_rate_kbps: info.get_f64("instantaneous_output_kbps").unwrap_or(0.0),
            },
            errors: ErrorCounters::default(),
            connected_clients: info.get_u64("connected_clients").unwrap_or(0),
            role: info.get_str("role").map(str::to_string),
            sampled_at: Utc::now(),
        }
    }

    /// Placeholder record for a node whose first probe failed
    pub fn unreachable(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: ConnectionStatus::Disconnected,
            latency_ms: 0.0,
            memory: MemoryStats::default(),
            throughput: ThroughputStats::default(),
            errors: ErrorCounters::default(),
            connected_clients: 0,
            role: None,
            sampled_at: Utc::now(),
        }
    }

    /// Replace this record with a fresh sample, carrying the error counters forward
    pub fn absorb(&mut self, mut fresh: NodeMetrics) {
        fresh.errors.add(&self.errors);
        *self = fresh;
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Point-in-time aggregate over all sampled nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_nodes: usize,
    pub connected_nodes: usize,
    /// Average over connected nodes
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub memory_used: u64,
    pub memory_max: u64,
    pub ops_per_sec: f64,
    pub read_rate_kbps: f64,
    pub write_rate_kbps: f64,
    pub errors: ErrorCounters,
}

impl ClusterMetrics {
    pub fn aggregate<'a>(samples: impl IntoIterator<Item = &'a NodeMetrics>) -> Self {
        let mut agg = ClusterMetrics {
            timestamp: Utc::now(),
            total_nodes: 0,
            connected_nodes: 0,
            avg_latency_ms: 0.0,
            max_latency_ms: 0.0,
            memory_used: 0,
            memory_max: 0,
            ops_per_sec: 0.0,
            read_rate_kbps: 0.0,
            write_rate_kbps: 0.0,
            errors: ErrorCounters::default(),
        };
        let mut latency_sum = 0.0;

        for sample in samples {
            agg.total_nodes += 1;
            agg.errors.add(&sample.errors);
            if !sample.is_connected() {
                continue;
            }
            agg.connected_nodes += 1;
            latency_sum += sample.latency_ms;
            agg.max_latency_ms = agg.max_latency_ms.max(sample.latency_ms);
            agg.memory_used += sample.memory.used;
            agg.memory_max += sample.memory.max;
            agg.ops_per_sec += sample.throughput.ops_per_sec;
            agg.read_rate_kbps += sample.throughput.read_rate_kbps;
            agg.write_rate_kbps += sample.throughput.write_rate_kbps;
        }

        if agg.connected_nodes > 0 {
            agg.avg_latency_ms = latency_sum / agg.connected_nodes as f64;
        }
        agg
    }
}
