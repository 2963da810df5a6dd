//! Warden - cache cluster lifecycle manager
//!
//! Keeps a registry of cache-server nodes, probes them on an interval and
//! drives the cluster through `Initializing -> Running <-> Degraded -> Failed`
//! (plus operator-controlled `Maintenance`).
//!
//! # Features
//! - Concurrent, time-bounded health probing with edge-triggered notifications
//! - Rolling per-node and cluster metrics
//! - Failover signalling by node priority
//! - Live slot partition snapshots
//! - HTTP admin API
//!
//! # Usage Example
//! ```ignore
//! use std::sync::Arc;
//! use warden::{ClusterManager, Config, RespConnector};
//!
//! let config = Config::from_file("warden.yaml")?;
//! let manager = ClusterManager::new(config, Arc::new(RespConnector));
//! let mut events = manager.subscribe();
//! manager.connect().await?;
//! ```

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod manager;
pub mod metadata;
pub mod monitor;

pub use config::{Config, ConfigError};
pub use driver::{CacheDriver, DriverConnector, DriverError, DriverEvent, RespConnector};
pub use error::{ClusterError, Result};
pub use event::{ChangeOrigin, ClusterEvent, EventBus};
pub use manager::{ClusterHealthReport, ClusterManager, TopologyDivergence};
pub use metadata::{ClusterMetrics, ClusterState, NodeHealth, NodeId, NodeMetrics, NodeSpec, PartitionInfo};
pub use monitor::{DeepHealthReport, HealthChecker, MetricsCollector};
