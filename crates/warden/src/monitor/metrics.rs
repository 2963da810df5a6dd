//! Metrics collector
//!
//! Samples every node on a fixed interval, keeps the latest sample per
//! node and a rolling history of cluster aggregates bounded by the
//! retention window.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{record_failure, sample_node};
use crate::config::MetricsConfig;
use crate::driver::CacheDriver;
use crate::event::{ClusterEvent, EventBus};
use crate::metadata::{ClusterMetrics, NodeId, NodeMetrics};

struct CollectorInner {
    config: MetricsConfig,
    probe_timeout: Duration,
    events: EventBus,
    driver: RwLock<Option<Arc<dyn CacheDriver>>>,
    latest: RwLock<BTreeMap<NodeId, NodeMetrics>>,
    history: RwLock<VecDeque<ClusterMetrics>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// Interval sampler with bounded history
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, probe_timeout: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                config,
                probe_timeout,
                events,
                driver: RwLock::new(None),
                latest: RwLock::new(BTreeMap::new()),
                history: RwLock::new(VecDeque::new()),
                stop: Mutex::new(None),
            }),
        }
    }

    /// Start sampling; the first collection happens right away
    pub fn start(&self, driver: Arc<dyn CacheDriver>) {
        if !self.inner.config.enabled {
            debug!("Metrics collection disabled, not starting");
            return;
        }
        self.stop();
        *self.inner.driver.write() = Some(driver);

        let period = self.inner.config.collect_interval().max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                MetricsCollector { inner }.collect_once().await;
            }
        });

        *self.inner.stop.lock() = Some(stop_tx);
        info!("Metrics collector started, interval {:?}", period);
    }

    pub fn stop(&self) {
        if let Some(stop) = self.inner.stop.lock().take() {
            let _ = stop.send(());
            info!("Metrics collector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.stop.lock().is_some()
    }

    /// Sample every known node once and record the aggregate
    pub async fn collect_once(&self) -> Option<ClusterMetrics> {
        let driver = self.inner.driver.read().clone()?;
        let nodes = match driver.known_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Metrics collection could not enumerate nodes: {}", e);
                return None;
            }
        };

        let probe_timeout = self.inner.probe_timeout;
        let results = join_all(nodes.iter().map(|node| {
            let driver = driver.clone();
            async move { sample_node(driver.as_ref(), node, probe_timeout).await }
        }))
        .await;

        let snapshot = {
            let mut latest = self.inner.latest.write();
            for (node, result) in nodes.iter().zip(results) {
                match result {
                    Ok(sample) => match latest.get_mut(node) {
                        Some(previous) => previous.absorb(sample),
                        None => {
                            latest.insert(node.clone(), sample);
                        }
                    },
                    Err(e) => {
                        debug!("Metrics sample for {} failed: {}", node, e);
                        let record = record_failure(latest.remove(node), node, &e);
                        latest.insert(node.clone(), record);
                    }
                }
            }
            ClusterMetrics::aggregate(nodes.iter().filter_map(|node| latest.get(node)))
        };

        self.push_history(snapshot.clone());
        self.inner
            .events
            .emit(ClusterEvent::MetricsUpdate(snapshot.clone()));
        Some(snapshot)
    }

    fn push_history(&self, snapshot: ClusterMetrics) {
        let mut history = self.inner.history.write();
        history.push_back(snapshot);

        let retention = chrono::Duration::from_std(self.inner.config.retention_period()).ok();
        let Some(cutoff) = retention.and_then(|r| Utc::now().checked_sub_signed(r)) else {
            return;
        };
        while history.front().is_some_and(|m| m.timestamp < cutoff) {
            history.pop_front();
        }
    }

    /// Most recent cluster aggregate
    pub fn latest(&self) -> Option<ClusterMetrics> {
        self.inner.history.read().back().cloned()
    }

    pub fn node_metrics(&self, node_id: &str) -> Option<NodeMetrics> {
        self.inner.latest.read().get(node_id).cloned()
    }

    pub fn all_node_metrics(&self) -> BTreeMap<NodeId, NodeMetrics> {
        self.inner.latest.read().clone()
    }

    /// Retained aggregates, oldest first
    pub fn history(&self) -> Vec<ClusterMetrics> {
        self.inner.history.read().iter().cloned().collect()
    }

    pub fn forget_node(&self, node_id: &str) {
        self.inner.latest.write().remove(node_id);
    }

    /// Stop and drop all samples and the driver
    pub fn reset(&self) {
        self.stop();
        self.inner.driver.write().take();
        self.inner.latest.write().clear();
        self.inner.history.write().clear();
    }
}
