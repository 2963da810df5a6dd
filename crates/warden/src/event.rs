//! Notification surface
//!
//! `ClusterEvent` is what callers observe through [`EventBus`].
//! `HealthEvent` is the narrower channel from the health checker to the
//! cluster manager.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::metadata::{ClusterMetrics, ClusterState, NodeId};

/// Broadcast buffer per subscriber; slow subscribers observe `Lagged`
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Who changed the node set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// `add_node` / `remove_node`
    Operator,
    /// Reported by the driver (discovery, meet, forget)
    Driver,
}

/// Events observable by callers of the cluster manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    Connected,
    Ready,
    Error { message: String },
    Disconnected,
    Reconnecting { node_id: NodeId },
    NodeAdded { node_id: NodeId, origin: ChangeOrigin },
    NodeRemoved { node_id: NodeId, origin: ChangeOrigin },
    NodeHealthy { node_id: NodeId },
    NodeUnhealthy { node_id: NodeId },
    ClusterDegraded,
    ClusterRestored,
    /// Advisory: the manager migrates nothing itself
    FailoverInitiated { failed_node: NodeId, candidate: NodeId },
    MaintenanceMode { entering: bool },
    MetricsUpdate(ClusterMetrics),
    StateChanged { from: ClusterState, to: ClusterState },
}

/// Typed broadcast channel for [`ClusterEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    /// Deliver to current subscribers; having none is fine
    pub fn emit(&self, event: ClusterEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Health transitions, emitted only when a verdict flips
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    NodeHealthChanged { node_id: NodeId, healthy: bool },
    ClusterHealthChanged { healthy: bool },
}

/// Receiver of health transitions
#[async_trait]
pub trait HealthEventHandler: Send + Sync {
    async fn handle_health_event(&self, event: HealthEvent);
}
