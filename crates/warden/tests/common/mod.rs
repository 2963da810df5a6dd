#![allow(dead_code)]

pub mod mock_driver;

use std::time::Duration;
use tokio::sync::broadcast;
use warden::config::Config;
use warden::{ClusterEvent, NodeSpec};

/// Config for manually driven tests: the health timer never fires during
/// a test (cycles are run with `run_health_check()`) and metrics
/// collection is off
pub fn test_config(nodes: &[(&str, u16, i32)]) -> Config {
    let mut config = Config::default();
    config.cluster.name = "test".to_string();
    config.nodes = nodes
        .iter()
        .map(|(host, port, priority)| NodeSpec::new(*host, *port).with_priority(*priority))
        .collect();
    config.health_check.interval_ms = 3_600_000;
    config.health_check.timeout_ms = 50;
    config.metrics.enabled = false;
    config.metrics.collect_interval_ms = 3_600_000;
    config
}

pub fn three_nodes() -> Config {
    test_config(&[("10.0.0.1", 7000, 1), ("10.0.0.2", 7000, 1), ("10.0.0.3", 7000, 1)])
}

/// Everything currently buffered on the receiver
pub fn drain(rx: &mut broadcast::Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let spawned forwarders run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
