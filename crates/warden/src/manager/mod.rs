//! Cluster manager
//!
//! Owns the node registry and the cluster state machine. Probing is done
//! by the [`HealthChecker`]; the manager only reacts to its verdicts and
//! issues topology commands when the operator changes the node set.

mod reconcile;

pub use reconcile::reconcile;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{
    parse_cluster_nodes, CacheDriver, ConnectOptions, DriverConnector, DriverError, DriverEvent,
};
use crate::error::{ClusterError, Result};
use crate::event::{ChangeOrigin, ClusterEvent, EventBus, HealthEvent, HealthEventHandler};
use crate::metadata::{
    ClusterMetrics, ClusterState, NodeHealth, NodeId, NodeMetrics, NodeSpec, PartitionInfo,
};
use crate::monitor::{DeepHealthReport, HealthChecker, MetricsCollector};

/// Registry entries and live topology members that do not match up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyDivergence {
    /// In the live topology but not registered
    pub unregistered: Vec<NodeId>,
    /// Registered but absent from the live topology
    pub missing: Vec<NodeId>,
}

impl TopologyDivergence {
    pub fn is_empty(&self) -> bool {
        self.unregistered.is_empty() && self.missing.is_empty()
    }
}

/// Deep health report plus registry/topology comparison
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealthReport {
    pub state: ClusterState,
    #[serde(flatten)]
    pub report: DeepHealthReport,
    /// `None` when the live topology could not be read
    pub divergence: Option<TopologyDivergence>,
}

struct ManagerInner {
    config: Config,
    connector: Arc<dyn DriverConnector>,
    nodes: RwLock<BTreeMap<NodeId, NodeSpec>>,
    state: RwLock<ClusterState>,
    driver: RwLock<Option<Arc<dyn CacheDriver>>>,
    health: HealthChecker,
    metrics: MetricsCollector,
    events: EventBus,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect, disconnect and maintenance changes
    lifecycle: tokio::sync::Mutex<()>,
}

/// Cluster lifecycle manager
///
/// Cheap to clone; clones share the same registry and state.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    /// Build a manager whose registry is seeded from `config.nodes`
    pub fn new(config: Config, connector: Arc<dyn DriverConnector>) -> Self {
        let events = EventBus::new();
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let handler: Weak<dyn HealthEventHandler> = weak.clone();
            ManagerInner {
                nodes: RwLock::new(config.nodes.iter().map(|n| (n.id(), n.clone())).collect()),
                state: RwLock::new(ClusterState::Initializing),
                driver: RwLock::new(None),
                health: HealthChecker::with_handler(config.health_check.clone(), handler),
                metrics: MetricsCollector::new(
                    config.metrics.clone(),
                    config.health_check.timeout(),
                    events.clone(),
                ),
                events,
                forwarder: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                connector,
                config,
            }
        });
        Self { inner }
    }

    /// Connect to the cluster and start health checking and metrics
    /// collection. A failed connect leaves the cluster `Failed`.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.driver().is_some() {
            debug!("Already connected");
            return Ok(());
        }

        let nodes: Vec<NodeSpec> = self.inner.nodes.read().values().cloned().collect();
        info!("Connecting to cluster {} ({} nodes)", self.inner.config.cluster.name, nodes.len());
        let options = ConnectOptions::from_config(&self.inner.config, nodes);

        let driver = match self.inner.connector.build(options) {
            Ok(driver) => driver,
            Err(e) => return Err(self.inner.connect_failed(e)),
        };
        let driver_events = driver.subscribe();
        if let Err(e) = driver.connect().await {
            return Err(self.inner.connect_failed(e));
        }

        *self.inner.driver.write() = Some(driver.clone());
        *self.inner.forwarder.lock() = Some(forward_driver_events(
            Arc::downgrade(&self.inner),
            driver_events,
        ));

        let maintenance = self.state() == ClusterState::Maintenance;
        if !maintenance {
            self.inner.transition_if(|_| true, ClusterState::Running);
        }
        self.inner.events.emit(ClusterEvent::Connected);
        info!("Connected to cluster {}", self.inner.config.cluster.name);

        if !maintenance {
            self.inner.health.start(driver.clone()).await;
        }
        self.inner.metrics.start(driver);
        Ok(())
    }

    /// Stop probing, close the driver and return to `Initializing`
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.health.stop();
        self.inner.metrics.stop();
        if let Some(forwarder) = self.inner.forwarder.lock().take() {
            forwarder.abort();
        }

        let driver = self.inner.driver.write().take();
        let result = match driver {
            Some(driver) => driver.disconnect().await,
            None => Ok(()),
        };

        self.inner.health.reset();
        self.inner.metrics.reset();
        self.inner.transition_if(|_| true, ClusterState::Initializing);
        self.inner.events.emit(ClusterEvent::Disconnected);
        info!("Disconnected from cluster {}", self.inner.config.cluster.name);
        Ok(result?)
    }

    /// Register a node. While `Running` the node is also introduced to the
    /// live cluster; if that fails the error is returned but the node stays
    /// registered.
    pub async fn add_node(&self, node: NodeSpec) -> Result<()> {
        let node_id = node.id();
        {
            let mut nodes = self.inner.nodes.write();
            if nodes.contains_key(&node_id) {
                return Err(ClusterError::NodeExists(node_id));
            }
            nodes.insert(node_id.clone(), node.clone());
        }
        info!("Node {} registered", node_id);
        self.inner.events.emit(ClusterEvent::NodeAdded {
            node_id: node_id.clone(),
            origin: ChangeOrigin::Operator,
        });

        if self.state() == ClusterState::Running {
            if let Some(driver) = self.driver() {
                if let Err(e) = driver.cluster_meet(&node.host, node.port).await {
                    warn!("CLUSTER MEET {} failed: {}", node_id, e);
                    return Err(e.into());
                }
                info!("Node {} introduced to the cluster", node_id);
            }
        }
        Ok(())
    }

    /// Deregister a node and, when connected, make the cluster forget it
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.inner
            .nodes
            .write()
            .remove(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;
        self.inner.health.forget_node(node_id);
        self.inner.metrics.forget_node(node_id);
        info!("Node {} deregistered", node_id);
        self.inner.events.emit(ClusterEvent::NodeRemoved {
            node_id: node_id.to_string(),
            origin: ChangeOrigin::Operator,
        });

        let result = match self.driver() {
            Some(driver) => forget_live(driver.as_ref(), node_id).await,
            None => Ok(()),
        };
        self.inner.check_cluster_state();
        result
    }

    /// Slot layout read fresh from the live topology
    pub async fn partition_info(&self) -> Result<PartitionInfo> {
        let driver = self.driver().ok_or(ClusterError::NotConnected)?;
        let slots = driver.cluster_slots().await?;
        let topology = parse_cluster_nodes(&driver.cluster_nodes().await?);
        Ok(PartitionInfo::build(&slots, &topology))
    }

    pub async fn enter_maintenance_mode(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == ClusterState::Maintenance {
            return Ok(());
        }
        self.inner.health.stop();
        self.inner.transition_if(|_| true, ClusterState::Maintenance);
        self.inner
            .events
            .emit(ClusterEvent::MaintenanceMode { entering: true });
        info!("Entered maintenance mode");
        Ok(())
    }

    /// Resume health checking and reconcile against fresh probe results.
    ///
    /// The restart cycle runs while still in `Maintenance`, so node flips it
    /// detects only shape the reconciled state: no `NodeUnhealthy` or
    /// `FailoverInitiated` is emitted for a node that failed during
    /// maintenance.
    pub async fn exit_maintenance_mode(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() != ClusterState::Maintenance {
            return Ok(());
        }
        self.inner
            .events
            .emit(ClusterEvent::MaintenanceMode { entering: false });
        info!("Leaving maintenance mode");

        match self.driver() {
            Some(driver) => {
                self.inner.health.start(driver).await;
                let target = self.inner.evaluate();
                self.inner
                    .transition_if(|s| s == ClusterState::Maintenance, target);
            }
            None => {
                self.inner
                    .transition_if(|s| s == ClusterState::Maintenance, ClusterState::Initializing);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ClusterState {
        *self.inner.state.read()
    }

    /// Copy of the registry
    pub fn nodes(&self) -> BTreeMap<NodeId, NodeSpec> {
        self.inner.nodes.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.driver().is_some()
    }

    /// Cluster aggregate over the newest sample of every node, whether it
    /// came from the health checker or the metrics collector
    pub fn metrics(&self) -> ClusterMetrics {
        ClusterMetrics::aggregate(self.merged_node_metrics().values())
    }

    pub fn node_metrics(&self, node_id: &str) -> Option<NodeMetrics> {
        newest(
            self.inner.health.node_metrics(node_id),
            self.inner.metrics.node_metrics(node_id),
        )
    }

    pub fn metrics_history(&self) -> Vec<ClusterMetrics> {
        self.inner.metrics.history()
    }

    fn merged_node_metrics(&self) -> BTreeMap<NodeId, NodeMetrics> {
        let mut merged = self.inner.health.all_node_metrics();
        for (node_id, sample) in self.inner.metrics.all_node_metrics() {
            let current = merged.remove(&node_id);
            if let Some(newest) = newest(current, Some(sample)) {
                merged.insert(node_id, newest);
            }
        }
        merged
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Health of every registered node
    pub fn health_status(&self) -> BTreeMap<NodeId, NodeHealth> {
        self.inner
            .nodes
            .read()
            .keys()
            .map(|id| (id.clone(), self.inner.health.node_status(id)))
            .collect()
    }

    /// Last cluster-wide verdict of the health checker
    pub fn is_healthy(&self) -> bool {
        self.inner.health.is_healthy()
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.inner.health.healthy_nodes()
    }

    /// Probe all nodes now instead of waiting for the next interval
    pub async fn run_health_check(&self) -> Result<()> {
        if self.driver().is_none() {
            return Err(ClusterError::NotConnected);
        }
        self.inner.health.run_cycle().await;
        Ok(())
    }

    pub async fn perform_deep_health_check(&self) -> Result<ClusterHealthReport> {
        let report = self.inner.health.perform_deep_health_check().await?;
        let divergence = if report.topology.is_empty() {
            None
        } else {
            let live: BTreeSet<NodeId> = report.topology.iter().map(|e| e.addr.clone()).collect();
            let registered: BTreeSet<NodeId> = self.inner.nodes.read().keys().cloned().collect();
            Some(TopologyDivergence {
                unregistered: live.difference(&registered).cloned().collect(),
                missing: registered.difference(&live).cloned().collect(),
            })
        };
        if let Some(d) = divergence.as_ref().filter(|d| !d.is_empty()) {
            warn!(
                "Registry and topology diverge: unregistered {:?}, missing {:?}",
                d.unregistered, d.missing
            );
        }
        Ok(ClusterHealthReport {
            state: self.state(),
            report,
            divergence,
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn driver(&self) -> Option<Arc<dyn CacheDriver>> {
        self.inner.driver.read().clone()
    }
}

fn newest(a: Option<NodeMetrics>, b: Option<NodeMetrics>) -> Option<NodeMetrics> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.sampled_at > a.sampled_at { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Resolve the cluster node ID of `addr` and forget it
async fn forget_live(driver: &dyn CacheDriver, addr: &str) -> Result<()> {
    let topology = parse_cluster_nodes(&driver.cluster_nodes().await?);
    match topology.iter().find(|entry| entry.addr == addr) {
        Some(entry) => {
            driver.cluster_forget(&entry.id).await?;
            info!("Cluster forgot node {} ({})", addr, entry.id);
        }
        None => warn!("Node {} is not in the live topology, nothing to forget", addr),
    }
    Ok(())
}

fn forward_driver_events(
    manager: Weak<ManagerInner>,
    mut events: broadcast::Receiver<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!("Missed {} driver events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(inner) = manager.upgrade() else {
                break;
            };
            inner.on_driver_event(event);
        }
    })
}

impl ManagerInner {
    fn connect_failed(&self, e: DriverError) -> ClusterError {
        error!("Failed to connect to cluster {}: {}", self.config.cluster.name, e);
        self.transition_if(|_| true, ClusterState::Failed);
        self.events.emit(ClusterEvent::Error {
            message: e.to_string(),
        });
        e.into()
    }

    /// Move to `to` if the current state passes `allowed`. Returns whether
    /// the state changed.
    fn transition_if(&self, allowed: impl Fn(ClusterState) -> bool, to: ClusterState) -> bool {
        let from = {
            let mut state = self.state.write();
            if *state == to || !allowed(*state) {
                return false;
            }
            std::mem::replace(&mut *state, to)
        };

        match to {
            ClusterState::Degraded | ClusterState::Failed => {
                warn!("Cluster state {} -> {}", from, to)
            }
            _ => info!("Cluster state {} -> {}", from, to),
        }
        self.events.emit(ClusterEvent::StateChanged { from, to });
        if to == ClusterState::Degraded {
            self.events.emit(ClusterEvent::ClusterDegraded);
        }
        if from == ClusterState::Degraded && to == ClusterState::Running {
            self.events.emit(ClusterEvent::ClusterRestored);
        }
        true
    }

    fn healthy_count(&self) -> (usize, usize) {
        let nodes = self.nodes.read();
        let healthy = nodes
            .keys()
            .filter(|id| self.health.node_status(id).is_usable())
            .count();
        (healthy, nodes.len())
    }

    fn evaluate(&self) -> ClusterState {
        let (healthy, total) = self.healthy_count();
        reconcile(healthy, total, self.health.is_healthy())
    }

    /// Level-triggered reconciliation; only moves between `Running`,
    /// `Degraded` and `Failed`, and never out of `Failed`
    fn check_cluster_state(&self) {
        let live = |s: ClusterState| matches!(s, ClusterState::Running | ClusterState::Degraded);
        if !live(*self.state.read()) {
            return;
        }
        let target = self.evaluate();
        debug!("Reconciled cluster state: {}", target);
        self.transition_if(live, target);
    }

    fn on_node_unhealthy(&self, node_id: NodeId) {
        self.events.emit(ClusterEvent::NodeUnhealthy {
            node_id: node_id.clone(),
        });

        let (healthy, total) = self.healthy_count();
        let target = if healthy == 0 && total > 0 {
            ClusterState::Failed
        } else {
            ClusterState::Degraded
        };
        self.transition_if(
            |s| matches!(s, ClusterState::Running | ClusterState::Degraded),
            target,
        );
        self.consider_failover(&node_id);
    }

    /// Signal the preferred replacement for `failed`: the other registered
    /// node with the highest priority, ties broken by address
    fn consider_failover(&self, failed: &str) {
        let mut candidates: Vec<NodeSpec> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.id() != failed)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id().cmp(&b.id())));

        match candidates.first() {
            Some(candidate) => {
                warn!("Failover initiated: {} -> {}", failed, candidate.id());
                self.events.emit(ClusterEvent::FailoverInitiated {
                    failed_node: failed.to_string(),
                    candidate: candidate.id(),
                });
            }
            None => error!("Node {} failed and no failover candidate is available", failed),
        }
    }

    fn on_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Connect => debug!("Driver connecting"),
            DriverEvent::Ready => {
                info!("Driver ready");
                self.events.emit(ClusterEvent::Ready);
            }
            DriverEvent::Error(message) => {
                warn!("Driver error: {}", message);
                self.events.emit(ClusterEvent::Error { message });
            }
            DriverEvent::Close => {
                warn!("Driver connection closed");
                self.events.emit(ClusterEvent::Disconnected);
            }
            DriverEvent::NodeAdded(node_id) => {
                debug!("Driver added node {}", node_id);
                self.events.emit(ClusterEvent::NodeAdded {
                    node_id,
                    origin: ChangeOrigin::Driver,
                });
            }
            DriverEvent::NodeRemoved(node_id) => {
                debug!("Driver removed node {}", node_id);
                self.events.emit(ClusterEvent::NodeRemoved {
                    node_id,
                    origin: ChangeOrigin::Driver,
                });
            }
            DriverEvent::Reconnecting(node_id) => {
                warn!("Driver reconnecting to {}", node_id);
                self.events.emit(ClusterEvent::Reconnecting { node_id });
            }
        }
    }
}

#[async_trait]
impl HealthEventHandler for ManagerInner {
    async fn handle_health_event(&self, event: HealthEvent) {
        if *self.state.read() == ClusterState::Maintenance {
            debug!("Ignoring {:?} during maintenance", event);
            return;
        }
        match event {
            HealthEvent::NodeHealthChanged {
                node_id,
                healthy: false,
            } => self.on_node_unhealthy(node_id),
            HealthEvent::NodeHealthChanged {
                node_id,
                healthy: true,
            } => {
                self.events.emit(ClusterEvent::NodeHealthy { node_id });
                self.check_cluster_state();
            }
            HealthEvent::ClusterHealthChanged { healthy: false } => {
                self.transition_if(|s| s == ClusterState::Running, ClusterState::Degraded);
            }
            HealthEvent::ClusterHealthChanged { healthy: true } => self.check_cluster_state(),
        }
    }
}
