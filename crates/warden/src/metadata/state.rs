//! Cluster operational state

use serde::{Deserialize, Serialize};

/// Cluster-wide state, owned by the cluster manager
///
/// `Initializing -> Running <-> Degraded -> Failed`, plus `Maintenance`
/// which is only entered and left by operator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    #[default]
    Initializing,
    Running,
    Degraded,
    Failed,
    Maintenance,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Initializing => write!(f, "initializing"),
            ClusterState::Running => write!(f, "running"),
            ClusterState::Degraded => write!(f, "degraded"),
            ClusterState::Failed => write!(f, "failed"),
            ClusterState::Maintenance => write!(f, "maintenance"),
        }
    }
}
