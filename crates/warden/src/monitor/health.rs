//! Health checker
//!
//! Periodically probes every node the driver knows about, concurrently,
//! and reports verdict flips to a [`HealthEventHandler`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{record_failure, sample_node};
use crate::config::HealthCheckConfig;
use crate::driver::{parse_cluster_nodes, parse_info, CacheDriver, ClusterNodeEntry, InfoMap};
use crate::error::{ClusterError, Result};
use crate::event::{HealthEvent, HealthEventHandler};
use crate::metadata::{NodeHealth, NodeId, NodeMetrics};

#[derive(Debug, Default)]
struct NodeRecord {
    status: NodeHealth,
    metrics: Option<NodeMetrics>,
}

struct ProbeTask {
    active: Arc<AtomicBool>,
    stop: oneshot::Sender<()>,
}

struct HealthInner {
    config: HealthCheckConfig,
    handler: Option<Weak<dyn HealthEventHandler>>,
    driver: RwLock<Option<Arc<dyn CacheDriver>>>,
    records: RwLock<HashMap<NodeId, NodeRecord>>,
    cluster_healthy: AtomicBool,
    last_check: RwLock<Option<DateTime<Utc>>>,
    task: Mutex<Option<ProbeTask>>,
    /// Serializes timer-driven and on-demand cycles
    cycle: tokio::sync::Mutex<()>,
}

/// Periodic node and cluster health prober
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<HealthInner>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self::build(config, None)
    }

    /// Checker reporting transitions to `handler` for as long as it lives
    pub fn with_handler(config: HealthCheckConfig, handler: Weak<dyn HealthEventHandler>) -> Self {
        Self::build(config, Some(handler))
    }

    fn build(config: HealthCheckConfig, handler: Option<Weak<dyn HealthEventHandler>>) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                config,
                handler,
                driver: RwLock::new(None),
                records: RwLock::new(HashMap::new()),
                cluster_healthy: AtomicBool::new(true),
                last_check: RwLock::new(None),
                task: Mutex::new(None),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Run one cycle now, then keep probing every `interval`.
    /// No-op when health checking is disabled.
    pub async fn start(&self, driver: Arc<dyn CacheDriver>) {
        if !self.inner.config.enabled {
            debug!("Health checking disabled, not starting");
            return;
        }
        self.stop();
        *self.inner.driver.write() = Some(driver);

        self.run_cycle().await;

        let period = self.inner.config.interval().max(Duration::from_millis(1));
        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(&self.inner);
        let flag = active.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                HealthChecker { inner }.run_cycle().await;
            }
            debug!("Health check loop exited");
        });

        *self.inner.task.lock() = Some(ProbeTask {
            active,
            stop: stop_tx,
        });
        info!("Health checker started, interval {:?}", period);
    }

    /// Stop the timer. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.active.store(false, Ordering::Release);
            let _ = task.stop.send(());
            info!("Health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Probe every known node once and dispatch any verdict flips
    pub async fn run_cycle(&self) {
        let _cycle = self.inner.cycle.lock().await;
        let driver = self.inner.driver.read().clone();
        let Some(driver) = driver else {
            debug!("Health cycle skipped, no driver");
            return;
        };
        let probe_timeout = self.inner.config.timeout();

        let mut events = Vec::new();
        let mut clean = true;

        match driver.known_nodes().await {
            Ok(nodes) => {
                let results = join_all(nodes.iter().map(|node| {
                    let driver = driver.clone();
                    async move { sample_node(driver.as_ref(), node, probe_timeout).await }
                }))
                .await;

                let mut records = self.inner.records.write();
                for (node, result) in nodes.iter().zip(results) {
                    let record = records.entry(node.clone()).or_default();
                    let was_usable = record.status.is_usable();
                    match result {
                        Ok(sample) => {
                            record.status = NodeHealth::Healthy;
                            match record.metrics.as_mut() {
                                Some(metrics) => metrics.absorb(sample),
                                None => record.metrics = Some(sample),
                            }
                        }
                        Err(e) => {
                            if e.is_unreachable() {
                                record.status = NodeHealth::Unhealthy;
                                debug!("Node {} probe failed: {}", node, e);
                            } else {
                                // reachable, so still healthy, but the cycle is not clean
                                record.status = NodeHealth::Healthy;
                                clean = false;
                                warn!("Node {} stats collection failed: {}", node, e);
                            }
                            record.metrics = Some(record_failure(record.metrics.take(), node, &e));
                        }
                    }

                    let usable = record.status.is_usable();
                    if usable != was_usable {
                        if usable {
                            info!("Node {} is healthy again", node);
                        } else {
                            warn!("Node {} became unhealthy", node);
                        }
                        events.push(HealthEvent::NodeHealthChanged {
                            node_id: node.clone(),
                            healthy: usable,
                        });
                    }
                }
            }
            Err(e) => {
                warn!("Health cycle could not enumerate nodes: {}", e);
                clean = false;
            }
        }

        let previous = self.inner.cluster_healthy.swap(clean, Ordering::AcqRel);
        if previous != clean {
            if clean {
                info!("Cluster health restored");
            } else {
                warn!("Cluster health check failed");
            }
            events.push(HealthEvent::ClusterHealthChanged { healthy: clean });
        }

        if let Some(handler) = self.inner.handler.as_ref().and_then(Weak::upgrade) {
            for event in events {
                handler.handle_health_event(event).await;
            }
        }

        *self.inner.last_check.write() = Some(Utc::now());
    }

    /// Last cluster-wide verdict
    pub fn is_healthy(&self) -> bool {
        self.inner.cluster_healthy.load(Ordering::Acquire)
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .inner
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.status == NodeHealth::Healthy)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// `Unknown` for a node never probed
    pub fn node_status(&self, node_id: &str) -> NodeHealth {
        self.inner
            .records
            .read()
            .get(node_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn node_metrics(&self, node_id: &str) -> Option<NodeMetrics> {
        self.inner
            .records
            .read()
            .get(node_id)
            .and_then(|r| r.metrics.clone())
    }

    pub fn all_node_metrics(&self) -> BTreeMap<NodeId, NodeMetrics> {
        self.inner
            .records
            .read()
            .iter()
            .filter_map(|(id, r)| r.metrics.clone().map(|m| (id.clone(), m)))
            .collect()
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_check.read()
    }

    pub fn forget_node(&self, node_id: &str) {
        self.inner.records.write().remove(node_id);
    }

    /// Drop the driver and every record, back to the never-started state
    pub fn reset(&self) {
        self.stop();
        self.inner.driver.write().take();
        self.inner.records.write().clear();
        self.inner.cluster_healthy.store(true, Ordering::Release);
        self.inner.last_check.write().take();
    }

    /// Cluster-level and per-node diagnostics. Per-node failures are
    /// recorded in the report.
    pub async fn perform_deep_health_check(&self) -> Result<DeepHealthReport> {
        let driver = self
            .inner
            .driver
            .read()
            .clone()
            .ok_or(ClusterError::HealthCheckerNotStarted)?;
        let probe_timeout = self.inner.config.timeout();
        let mut errors = Vec::new();

        let cluster_info = match driver.cluster_info().await {
            Ok(text) => Some(parse_info(&text)),
            Err(e) => {
                errors.push(format!("cluster info: {}", e));
                None
            }
        };
        let topology = match driver.cluster_nodes().await {
            Ok(text) => parse_cluster_nodes(&text),
            Err(e) => {
                errors.push(format!("cluster nodes: {}", e));
                Vec::new()
            }
        };

        let nodes = driver.known_nodes().await?;
        let diagnostics = join_all(
            nodes
                .iter()
                .map(|node| diagnose(driver.as_ref(), node, probe_timeout)),
        )
        .await;
        let nodes = nodes
            .into_iter()
            .zip(diagnostics)
            .map(|(node, mut diag)| {
                diag.health = self.node_status(&node);
                (node, diag)
            })
            .collect();

        Ok(DeepHealthReport {
            checked_at: Utc::now(),
            cluster_healthy: self.is_healthy(),
            cluster_info,
            topology,
            nodes,
            errors,
        })
    }
}

async fn diagnose(driver: &dyn CacheDriver, node: &str, probe_timeout: Duration) -> NodeDiagnostics {
    let mut diag = NodeDiagnostics::default();
    match timeout(probe_timeout, driver.info(node, None)).await {
        Ok(Ok(text)) => diag.info = Some(parse_info(&text)),
        Ok(Err(e)) => diag.error = Some(e.to_string()),
        Err(_) => diag.error = Some(format!("INFO timed out after {:?}", probe_timeout)),
    }
    if diag.error.is_none() {
        match timeout(probe_timeout, driver.info(node, Some("replication"))).await {
            Ok(Ok(text)) => diag.replication = Some(parse_info(&text)),
            Ok(Err(e)) => diag.error = Some(e.to_string()),
            Err(_) => {
                diag.error = Some(format!("INFO replication timed out after {:?}", probe_timeout))
            }
        }
    }
    diag
}

/// Result of an on-demand diagnostic probe
#[derive(Debug, Clone, Serialize)]
pub struct DeepHealthReport {
    pub checked_at: DateTime<Utc>,
    /// Last cluster-wide verdict of the periodic checker
    pub cluster_healthy: bool,
    /// Parsed `CLUSTER INFO`, `None` when the server refused it
    pub cluster_info: Option<InfoMap>,
    pub topology: Vec<ClusterNodeEntry>,
    pub nodes: BTreeMap<NodeId, NodeDiagnostics>,
    /// Cluster-level command failures
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeDiagnostics {
    pub health: NodeHealth,
    pub info: Option<InfoMap>,
    pub replication: Option<InfoMap>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, DriverEvent, SlotOwnership};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::broadcast;

    /// Two-node driver where individual nodes can be taken down
    struct StubDriver {
        down: Mutex<HashSet<String>>,
        fail_enumeration: AtomicBool,
        events: broadcast::Sender<DriverEvent>,
    }

    impl StubDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                down: Mutex::new(HashSet::new()),
                fail_enumeration: AtomicBool::new(false),
                events: broadcast::channel(8).0,
            })
        }

        fn set_down(&self, node: &str, down: bool) {
            if down {
                self.down.lock().insert(node.to_string());
            } else {
                self.down.lock().remove(node);
            }
        }
    }

    #[async_trait]
    impl CacheDriver for StubDriver {
        async fn connect(&self) -> std::result::Result<(), DriverError> {
            Ok(())
        }
        async fn disconnect(&self) -> std::result::Result<(), DriverError> {
            Ok(())
        }
        async fn known_nodes(&self) -> std::result::Result<Vec<NodeId>, DriverError> {
            if self.fail_enumeration.load(Ordering::Acquire) {
                return Err(DriverError::NotConnected);
            }
            Ok(vec!["a:1".into(), "b:1".into()])
        }
        async fn ping(&self, node: &str) -> std::result::Result<(), DriverError> {
            if self.down.lock().contains(node) {
                Err(DriverError::Connection("refused".into()))
            } else {
                Ok(())
            }
        }
        async fn info(
            &self,
            _node: &str,
            _section: Option<&str>,
        ) -> std::result::Result<String, DriverError> {
            Ok("# Clients\r\nconnected_clients:3\r\n".into())
        }
        async fn cluster_info(&self) -> std::result::Result<String, DriverError> {
            Ok("cluster_state:ok\r\n".into())
        }
        async fn cluster_nodes(&self) -> std::result::Result<String, DriverError> {
            Err(DriverError::Command("ERR cluster support disabled".into()))
        }
        async fn cluster_slots(&self) -> std::result::Result<Vec<SlotOwnership>, DriverError> {
            Ok(Vec::new())
        }
        async fn cluster_meet(&self, _: &str, _: u16) -> std::result::Result<(), DriverError> {
            Ok(())
        }
        async fn cluster_forget(&self, _: &str) -> std::result::Result<(), DriverError> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
            self.events.subscribe()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<HealthEvent>>,
    }

    #[async_trait]
    impl HealthEventHandler for Recorder {
        async fn handle_health_event(&self, event: HealthEvent) {
            self.events.lock().push(event);
        }
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_ms: 60_000,
            timeout_ms: 100,
            retries: 1,
        }
    }

    fn checker_with_recorder() -> (HealthChecker, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn HealthEventHandler> = {
            let as_dyn: Arc<dyn HealthEventHandler> = recorder.clone();
            Arc::downgrade(&as_dyn)
        };
        (HealthChecker::with_handler(config(), weak), recorder)
    }

    #[tokio::test]
    async fn test_node_transitions_are_edge_triggered() {
        let (checker, recorder) = checker_with_recorder();
        let driver = StubDriver::new();
        checker.start(driver.clone()).await;

        // first cycle: Unknown -> Healthy does not notify
        assert!(recorder.events.lock().is_empty());
        assert_eq!(checker.node_status("a:1"), NodeHealth::Healthy);
        assert_eq!(checker.healthy_nodes(), vec!["a:1".to_string(), "b:1".to_string()]);
        assert!(checker.last_check().is_some());

        driver.set_down("b:1", true);
        checker.run_cycle().await;
        checker.run_cycle().await;
        assert_eq!(
            *recorder.events.lock(),
            vec![HealthEvent::NodeHealthChanged {
                node_id: "b:1".into(),
                healthy: false
            }]
        );
        // unreachable nodes are classified, not errors
        assert!(checker.is_healthy());

        let metrics = checker.node_metrics("b:1").unwrap();
        assert_eq!(metrics.errors.connection, 2);
        assert_eq!(metrics.connected_clients, 3);

        driver.set_down("b:1", false);
        checker.run_cycle().await;
        assert_eq!(recorder.events.lock().len(), 2);
        assert_eq!(checker.node_metrics("b:1").unwrap().errors.connection, 2);

        checker.stop();
    }

    #[tokio::test]
    async fn test_timer_probes_until_stopped() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn HealthEventHandler> = {
            let as_dyn: Arc<dyn HealthEventHandler> = recorder.clone();
            Arc::downgrade(&as_dyn)
        };
        let mut cfg = config();
        cfg.interval_ms = 10;
        cfg.timeout_ms = 5;
        let checker = HealthChecker::with_handler(cfg, weak);
        let driver = StubDriver::new();
        checker.start(driver.clone()).await;
        let started = checker.last_check().unwrap();

        // the timer alone notices the outage
        driver.set_down("b:1", true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(checker.last_check().unwrap() > started);
        assert_eq!(checker.node_status("b:1"), NodeHealth::Unhealthy);
        assert_eq!(recorder.events.lock().len(), 1);

        checker.stop();
        assert!(!checker.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = checker.last_check();

        driver.set_down("b:1", false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(checker.last_check(), stopped);
        assert_eq!(checker.node_status("b:1"), NodeHealth::Unhealthy);
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_verdict_flips_once() {
        let (checker, recorder) = checker_with_recorder();
        let driver = StubDriver::new();
        checker.start(driver.clone()).await;

        driver.fail_enumeration.store(true, Ordering::Release);
        checker.run_cycle().await;
        checker.run_cycle().await;
        assert!(!checker.is_healthy());

        driver.fail_enumeration.store(false, Ordering::Release);
        checker.run_cycle().await;
        assert!(checker.is_healthy());
        assert_eq!(
            *recorder.events.lock(),
            vec![
                HealthEvent::ClusterHealthChanged { healthy: false },
                HealthEvent::ClusterHealthChanged { healthy: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_and_stop_idempotent() {
        let mut cfg = config();
        cfg.enabled = false;
        let checker = HealthChecker::new(cfg);
        checker.start(StubDriver::new()).await;
        assert!(!checker.is_running());
        assert!(checker.last_check().is_none());

        checker.stop();
        checker.stop();
        assert!(matches!(
            checker.perform_deep_health_check().await,
            Err(ClusterError::HealthCheckerNotStarted)
        ));
    }

    #[tokio::test]
    async fn test_deep_health_check_records_failures() {
        let checker = HealthChecker::new(config());
        checker.start(StubDriver::new()).await;

        let report = checker.perform_deep_health_check().await.unwrap();
        assert_eq!(
            report.cluster_info.unwrap().get_str("cluster_state"),
            Some("ok")
        );
        assert!(report.topology.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.nodes.len(), 2);
        assert!(report.nodes["a:1"].replication.is_some());
        assert_eq!(report.nodes["a:1"].health, NodeHealth::Healthy);

        checker.stop();
        checker.stop();
        assert!(!checker.is_running());
        checker.reset();
        assert_eq!(checker.node_status("a:1"), NodeHealth::Unknown);
    }
}
