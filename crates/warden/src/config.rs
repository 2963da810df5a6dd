//! Configuration module
//!
//! YAML configuration for the cluster manager, its health checker and
//! metrics collector

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::metadata::NodeSpec;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Seed / registered nodes
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Check value ranges and node uniqueness
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.host.is_empty() || node.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "invalid node address {}",
                    node.id()
                )));
            }
            if !seen.insert(node.id()) {
                return Err(ConfigError::Invalid(format!("duplicate node {}", node.id())));
            }
        }

        if self.connection.connect_timeout_ms == 0 || self.connection.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection timeouts must be greater than 0".to_string(),
            ));
        }

        let hc = &self.health_check;
        if hc.interval_ms == 0 || hc.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "health_check interval and timeout must be greater than 0".to_string(),
            ));
        }
        if hc.timeout_ms >= hc.interval_ms {
            return Err(ConfigError::Invalid(
                "health_check timeout must be less than interval".to_string(),
            ));
        }

        if self.metrics.collect_interval_ms == 0 || self.metrics.retention_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "metrics interval and retention must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Cluster identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
        }
    }
}

/// Driver connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_redirections")]
    pub max_redirections: u32,
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_redirections: default_max_redirections(),
            enable_offline_queue: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Health checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Dial attempts per seed when the driver connects
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            retries: default_health_retries(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Metrics collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_collect_interval_ms")]
    pub collect_interval_ms: u64,
    #[serde(default = "default_retention_period_secs")]
    pub retention_period_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval_ms: default_collect_interval_ms(),
            retention_period_secs: default_retention_period_secs(),
        }
    }
}

impl MetricsConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }
}

/// HTTP admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            http_addr: default_http_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10000 // 10 seconds
}

fn default_command_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_max_redirections() -> u32 {
    16
}

fn default_health_interval_ms() -> u64 {
    30000 // 30 seconds
}

fn default_health_timeout_ms() -> u64 {
    5000 // 5 seconds
}

fn default_health_retries() -> u32 {
    3
}

fn default_collect_interval_ms() -> u64 {
    10000 // 10 seconds
}

fn default_retention_period_secs() -> u64 {
    3600 // 1 hour
}

fn default_http_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
