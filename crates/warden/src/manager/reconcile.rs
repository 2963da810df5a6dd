//! Cluster state reconciliation

use crate::metadata::ClusterState;

/// Compute the state the cluster should be in from the current health of
/// its registered nodes.
///
/// The per-node count is authoritative for `Failed` and `Degraded`.
/// `Running` additionally requires the health checker's aggregate verdict
/// to be healthy, so a cycle with unexpected collection errors keeps the
/// cluster `Degraded` even when every node answered its ping.
pub fn reconcile(healthy: usize, total: usize, aggregate_healthy: bool) -> ClusterState {
    if healthy == 0 {
        ClusterState::Failed
    } else if healthy >= total && aggregate_healthy {
        ClusterState::Running
    } else {
        ClusterState::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_boundaries() {
        for total in 1..6 {
            assert_eq!(reconcile(0, total, true), ClusterState::Failed);
            assert_eq!(reconcile(total, total, true), ClusterState::Running);
            for healthy in 1..total {
                assert_eq!(reconcile(healthy, total, true), ClusterState::Degraded);
            }
        }
    }

    #[test]
    fn test_aggregate_verdict_blocks_running() {
        assert_eq!(reconcile(3, 3, false), ClusterState::Degraded);
        assert_eq!(reconcile(0, 3, false), ClusterState::Failed);
    }

    #[test]
    fn test_empty_registry_is_failed() {
        assert_eq!(reconcile(0, 0, true), ClusterState::Failed);
    }
}
