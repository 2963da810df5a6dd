//! Node probing
//!
//! The health checker and the metrics collector share one sampling step:
//! a bounded `PING` for reachability and latency, then `INFO` for stats.

mod health;
mod metrics;

pub use health::{DeepHealthReport, HealthChecker, NodeDiagnostics};
pub use metrics::MetricsCollector;

use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::driver::{parse_info, CacheDriver, DriverError};
use crate::metadata::{ConnectionStatus, ErrorCounters, NodeMetrics};

/// Why a node could not be sampled
#[derive(Debug, Clone, thiserror::Error)]
pub enum SampleError {
    /// The ping did not finish within the probe timeout
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    /// The ping failed
    #[error("node unreachable: {0}")]
    Unreachable(DriverError),
    /// The ping succeeded but the stats probe did not
    #[error("stats probe failed: {0}")]
    Stats(DriverError),
}

impl SampleError {
    /// Whether the node should be classified unhealthy
    pub fn is_unreachable(&self) -> bool {
        !matches!(self, SampleError::Stats(_))
    }

    /// Counter increments this failure contributes
    pub fn counters(&self) -> ErrorCounters {
        let mut counters = ErrorCounters::default();
        match self {
            SampleError::Timeout(_) | SampleError::Unreachable(DriverError::Timeout(_)) => {
                counters.timeout = 1;
                counters.connection = 1;
            }
            SampleError::Unreachable(_) => counters.connection = 1,
            SampleError::Stats(e) if e.is_cluster_error() => counters.cluster = 1,
            SampleError::Stats(DriverError::Timeout(_)) => counters.timeout = 1,
            SampleError::Stats(_) => counters.command = 1,
        }
        counters
    }
}

/// Probe one node. Both round trips share the `probe_timeout` budget so a
/// hung node can never stall the cycle.
pub async fn sample_node(
    driver: &dyn CacheDriver,
    node: &str,
    probe_timeout: Duration,
) -> Result<NodeMetrics, SampleError> {
    let started = Instant::now();
    match timeout(probe_timeout, driver.ping(node)).await {
        Err(_) => return Err(SampleError::Timeout(probe_timeout)),
        Ok(Err(e)) => return Err(SampleError::Unreachable(e)),
        Ok(Ok(())) => {}
    }
    let latency = started.elapsed();

    let remaining = probe_timeout.saturating_sub(latency);
    let text = match timeout(remaining, driver.info(node, None)).await {
        Err(_) => return Err(SampleError::Stats(DriverError::Timeout(probe_timeout))),
        Ok(result) => result.map_err(SampleError::Stats)?,
    };
    Ok(NodeMetrics::from_info(node, &parse_info(&text), latency))
}

/// Apply a failed sample to the previous record, keeping its last good data
pub(crate) fn record_failure(
    previous: Option<NodeMetrics>,
    node: &str,
    error: &SampleError,
) -> NodeMetrics {
    let mut record = previous.unwrap_or_else(|| NodeMetrics::unreachable(node));
    record.errors.add(&error.counters());
    if error.is_unreachable() {
        record.status = ConnectionStatus::Disconnected;
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_counters() {
        let c = SampleError::Timeout(Duration::from_millis(10)).counters();
        assert_eq!((c.timeout, c.connection, c.command), (1, 1, 0));

        let c = SampleError::Unreachable(DriverError::Connection("refused".into())).counters();
        assert_eq!((c.timeout, c.connection), (0, 1));

        let c = SampleError::Stats(DriverError::Command("CLUSTERDOWN".into())).counters();
        assert_eq!((c.cluster, c.command), (1, 0));

        let c = SampleError::Stats(DriverError::Command("ERR".into())).counters();
        assert_eq!((c.cluster, c.command), (0, 1));
    }

    #[test]
    fn test_record_failure_keeps_last_sample() {
        let info = parse_info("used_memory:2048\r\n");
        let good = NodeMetrics::from_info("n1:1", &info, Duration::from_millis(2));

        let err = SampleError::Unreachable(DriverError::Connection("reset".into()));
        let record = record_failure(Some(good.clone()), "n1:1", &err);
        assert_eq!(record.memory.used, 2048);
        assert_eq!(record.errors.connection, 1);
        assert_eq!(record.status, ConnectionStatus::Disconnected);

        let record = record_failure(Some(record), "n1:1", &err);
        assert_eq!(record.errors.connection, 2);

        let fresh = record_failure(None, "n2:1", &SampleError::Timeout(Duration::ZERO));
        assert_eq!(fresh.errors.timeout, 1);
        assert_eq!(fresh.memory.used, 0);
    }
}
