//! Error types

use crate::config::ConfigError;
use crate::driver::DriverError;
use crate::metadata::NodeId;

/// Errors returned by cluster manager operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Node {0} already exists")]
    NodeExists(NodeId),
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),
    #[error("Cluster not connected")]
    NotConnected,
    #[error("Health checker not started")]
    HealthCheckerNotStarted,
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
