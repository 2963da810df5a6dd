//! Cache driver boundary
//!
//! The manager, health checker and metrics collector only talk to cache
//! servers through [`CacheDriver`]. [`RespDriver`] is the TCP implementation.

mod info;
mod resp_driver;
mod topology;

pub use info::{parse_info, InfoMap};
pub use resp_driver::{RespConnector, RespDriver};
pub use topology::{parse_cluster_nodes, ClusterNodeEntry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::metadata::{NodeId, NodeSpec};

/// Driver event channel capacity
pub const DRIVER_EVENT_CAPACITY: usize = 256;

/// Driver error
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Command error: {0}")]
    Command(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Driver not connected")]
    NotConnected,
    #[error("Unknown node: {0}")]
    UnknownNode(String),
}

impl DriverError {
    /// Replies that signal cluster-level trouble rather than a bad command
    pub fn is_cluster_error(&self) -> bool {
        match self {
            DriverError::Command(msg) => ["CLUSTERDOWN", "MOVED", "ASK", "TRYAGAIN", "CROSSSLOT"]
                .iter()
                .any(|prefix| msg.starts_with(prefix)),
            _ => false,
        }
    }
}

impl From<resp::RespError> for DriverError {
    fn from(e: resp::RespError) -> Self {
        match e {
            resp::RespError::Io(e) => DriverError::Connection(e.to_string()),
            resp::RespError::UnexpectedEof => {
                DriverError::Connection("connection closed by peer".to_string())
            }
            resp::RespError::Server(msg) => DriverError::Command(msg),
            other => DriverError::Protocol(other.to_string()),
        }
    }
}

/// Lifecycle events raised by a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Connect,
    Ready,
    Error(String),
    Close,
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    Reconnecting(NodeId),
}

/// One `CLUSTER SLOTS` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOwnership {
    pub start: u16,
    /// Inclusive
    pub end: u16,
    pub master: NodeId,
    pub replicas: Vec<NodeId>,
}

/// Options a connector builds a driver from
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub nodes: Vec<NodeSpec>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_redirections: u32,
    pub enable_offline_queue: bool,
    /// Dial attempts per seed during `connect`
    pub connect_attempts: u32,
}

impl ConnectOptions {
    pub fn from_config(config: &Config, nodes: Vec<NodeSpec>) -> Self {
        Self {
            nodes,
            connect_timeout: config.connection.connect_timeout(),
            command_timeout: config.connection.command_timeout(),
            max_redirections: config.connection.max_redirections,
            enable_offline_queue: config.connection.enable_offline_queue,
            connect_attempts: config.health_check.retries.max(1),
        }
    }
}

/// Connection to a cache cluster
#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Establish connections to the seed nodes
    async fn connect(&self) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;

    /// Nodes the driver currently knows about
    async fn known_nodes(&self) -> Result<Vec<NodeId>, DriverError>;

    async fn ping(&self, node: &str) -> Result<(), DriverError>;

    /// Raw `INFO [section]` text of one node
    async fn info(&self, node: &str, section: Option<&str>) -> Result<String, DriverError>;

    /// Raw `CLUSTER INFO` text
    async fn cluster_info(&self) -> Result<String, DriverError>;

    /// Raw `CLUSTER NODES` text
    async fn cluster_nodes(&self) -> Result<String, DriverError>;

    async fn cluster_slots(&self) -> Result<Vec<SlotOwnership>, DriverError>;

    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), DriverError>;

    /// Forget a node by its cluster node ID
    async fn cluster_forget(&self, cluster_node_id: &str) -> Result<(), DriverError>;

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}

/// Builds drivers for the cluster manager
pub trait DriverConnector: Send + Sync {
    fn build(&self, options: ConnectOptions) -> Result<Arc<dyn CacheDriver>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_error_classification() {
        assert!(DriverError::Command("CLUSTERDOWN The cluster is down".into()).is_cluster_error());
        assert!(DriverError::Command("MOVED 3999 127.0.0.1:6381".into()).is_cluster_error());
        assert!(!DriverError::Command("ERR unknown command".into()).is_cluster_error());
        assert!(!DriverError::Timeout(Duration::from_secs(1)).is_cluster_error());
    }

    #[test]
    fn test_resp_error_mapping() {
        let e: DriverError = resp::RespError::Server("ERR nope".into()).into();
        assert!(matches!(e, DriverError::Command(_)));
        let e: DriverError = resp::RespError::UnexpectedEof.into();
        assert!(matches!(e, DriverError::Connection(_)));
    }

    #[test]
    fn test_connect_options_from_config() {
        let mut config = Config::default();
        config.health_check.retries = 0;
        let options = ConnectOptions::from_config(&config, vec![NodeSpec::new("a", 1)]);
        assert_eq!(options.connect_attempts, 1);
        assert_eq!(options.command_timeout, Duration::from_secs(5));
        assert_eq!(options.nodes.len(), 1);
    }
}
