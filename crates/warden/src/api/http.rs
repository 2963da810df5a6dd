//! HTTP admin API
//!
//! RESTful control surface over a [`ClusterManager`]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::error::ClusterError;
use crate::manager::ClusterManager;
use crate::metadata::{ClusterState, NodeHealth, NodeId, NodeSpec};

/// HTTP API service
pub struct HttpApi {
    manager: ClusterManager,
}

impl HttpApi {
    pub fn new(manager: ClusterManager) -> Self {
        Self { manager }
    }

    pub fn router(self) -> Router {
        Router::new()
            // cluster
            .route("/api/v1/cluster", get(get_cluster))
            .route("/api/v1/partitions", get(get_partitions))
            // nodes
            .route("/api/v1/nodes", get(list_nodes).post(add_node))
            .route("/api/v1/nodes/:node_id", axum::routing::delete(remove_node))
            .route("/api/v1/nodes/:node_id/metrics", get(get_node_metrics))
            // health
            .route("/api/v1/health", get(get_health))
            .route("/api/v1/health/check", post(run_health_check))
            .route("/api/v1/health/deep", get(deep_health_check))
            // metrics
            .route("/api/v1/metrics", get(get_metrics))
            .route("/api/v1/metrics/history", get(get_metrics_history))
            // maintenance
            .route(
                "/api/v1/maintenance",
                post(enter_maintenance).delete(exit_maintenance),
            )
            .with_state(self.manager)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

fn status_of(e: &ClusterError) -> StatusCode {
    match e {
        ClusterError::NodeExists(_) => StatusCode::CONFLICT,
        ClusterError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::NotConnected | ClusterError::HealthCheckerNotStarted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ClusterError::InvalidAddress(_) | ClusterError::Config(_) => StatusCode::BAD_REQUEST,
        ClusterError::Driver(_) => StatusCode::BAD_GATEWAY,
    }
}

fn failure<T: Serialize>(e: ClusterError) -> (StatusCode, Json<ApiResponse<T>>) {
    (status_of(&e), ApiResponse::err(e.to_string()))
}

#[derive(Serialize)]
struct ClusterOverview {
    name: String,
    state: ClusterState,
    connected: bool,
    healthy: bool,
    node_count: usize,
    healthy_nodes: Vec<NodeId>,
}

#[derive(Serialize)]
struct NodeView {
    id: NodeId,
    #[serde(flatten)]
    spec: NodeSpec,
    health: NodeHealth,
}

#[derive(Serialize)]
struct StateResponse {
    state: ClusterState,
}

// ==================== Handlers ====================

async fn get_cluster(State(manager): State<ClusterManager>) -> impl IntoResponse {
    ApiResponse::ok(ClusterOverview {
        name: manager.config().cluster.name.clone(),
        state: manager.state(),
        connected: manager.is_connected(),
        healthy: manager.is_healthy(),
        node_count: manager.nodes().len(),
        healthy_nodes: manager.healthy_nodes(),
    })
}

async fn get_partitions(State(manager): State<ClusterManager>) -> impl IntoResponse {
    match manager.partition_info().await {
        Ok(info) => (StatusCode::OK, ApiResponse::ok(info)),
        Err(e) => failure(e),
    }
}

async fn list_nodes(State(manager): State<ClusterManager>) -> impl IntoResponse {
    let health = manager.health_status();
    let nodes: Vec<NodeView> = manager
        .nodes()
        .into_iter()
        .map(|(id, spec)| NodeView {
            health: health.get(&id).copied().unwrap_or_default(),
            id,
            spec,
        })
        .collect();
    ApiResponse::ok(nodes)
}

async fn add_node(
    State(manager): State<ClusterManager>,
    Json(node): Json<NodeSpec>,
) -> impl IntoResponse {
    let node_id = node.id();
    if node.host.is_empty() || node.port == 0 {
        return failure(ClusterError::InvalidAddress(node_id));
    }
    match manager.add_node(node).await {
        Ok(()) => {
            info!("Node {} added via HTTP API", node_id);
            (StatusCode::CREATED, ApiResponse::ok(node_id))
        }
        Err(e) => failure(e),
    }
}

async fn remove_node(
    State(manager): State<ClusterManager>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match manager.remove_node(&node_id).await {
        Ok(()) => {
            info!("Node {} removed via HTTP API", node_id);
            (StatusCode::OK, ApiResponse::ok(node_id))
        }
        Err(e) => failure(e),
    }
}

async fn get_node_metrics(
    State(manager): State<ClusterManager>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match manager.node_metrics(&node_id) {
        Some(metrics) => (StatusCode::OK, ApiResponse::ok(metrics)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::err(format!("No metrics for node {}", node_id)),
        ),
    }
}

async fn get_health(State(manager): State<ClusterManager>) -> impl IntoResponse {
    ApiResponse::ok(manager.health_status())
}

async fn run_health_check(State(manager): State<ClusterManager>) -> impl IntoResponse {
    match manager.run_health_check().await {
        Ok(()) => (StatusCode::OK, ApiResponse::ok(manager.health_status())),
        Err(e) => failure(e),
    }
}

async fn deep_health_check(State(manager): State<ClusterManager>) -> impl IntoResponse {
    match manager.perform_deep_health_check().await {
        Ok(report) => (StatusCode::OK, ApiResponse::ok(report)),
        Err(e) => failure(e),
    }
}

async fn get_metrics(State(manager): State<ClusterManager>) -> impl IntoResponse {
    ApiResponse::ok(manager.metrics())
}

async fn get_metrics_history(State(manager): State<ClusterManager>) -> impl IntoResponse {
    ApiResponse::ok(manager.metrics_history())
}

async fn enter_maintenance(State(manager): State<ClusterManager>) -> impl IntoResponse {
    match manager.enter_maintenance_mode().await {
        Ok(()) => (
            StatusCode::OK,
            ApiResponse::ok(StateResponse {
                state: manager.state(),
            }),
        ),
        Err(e) => failure(e),
    }
}

async fn exit_maintenance(State(manager): State<ClusterManager>) -> impl IntoResponse {
    match manager.exit_maintenance_mode().await {
        Ok(()) => (
            StatusCode::OK,
            ApiResponse::ok(StateResponse {
                state: manager.state(),
            }),
        ),
        Err(e) => failure(e),
    }
}
