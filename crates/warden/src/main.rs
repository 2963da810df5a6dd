//! Warden service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use warden::{api::HttpApi, ClusterEvent, ClusterManager, Config, NodeSpec, RespConnector};

/// Warden - cache cluster lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Health checking, metrics and failover signalling for a cache cluster")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed node (host:port), may be repeated
    #[arg(short, long = "node")]
    nodes: Vec<String>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Do not serve the HTTP API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    for addr in &args.nodes {
        let node = NodeSpec::parse(addr)?;
        if !config.nodes.iter().any(|n| n.id() == node.id()) {
            config.nodes.push(node);
        }
    }
    if let Some(addr) = args.http_addr {
        config.api.http_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.no_api {
        config.api.enabled = false;
    }
    config.validate()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Warden...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Nodes: {}", config.nodes.len());
    if config.api.enabled {
        info!("  HTTP API: {}", config.api.http_addr);
    }

    let manager = ClusterManager::new(config.clone(), Arc::new(RespConnector));

    let mut events = manager.subscribe();
    let _event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::MetricsUpdate(metrics)) => debug!(
                    "Metrics: {}/{} nodes connected, {:.1} ops/s",
                    metrics.connected_nodes, metrics.total_nodes, metrics.ops_per_sec
                ),
                Ok(event) => info!("Cluster event: {:?}", event),
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager.connect().await?;
    info!("Cluster state: {}", manager.state());

    if config.api.enabled {
        let app = HttpApi::new(manager.clone()).router();
        let listener = tokio::net::TcpListener::bind(&config.api.http_addr).await?;
        info!("HTTP API listening on {}", config.api.http_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    manager.disconnect().await?;
    Ok(())
}
