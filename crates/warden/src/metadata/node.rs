//! Node definitions

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Node ID (`host:port`)
pub type NodeId = String;

/// One cache-server endpoint known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub host: String,
    pub port: u16,
    /// AUTH password
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Logical database index (SELECT)
    #[serde(default)]
    pub db: Option<u32>,
    /// Failover preference, higher wins
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    1
}

impl NodeSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: None,
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = Some(db);
        self
    }

    /// Registry key
    pub fn id(&self) -> NodeId {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse `host:port`
    pub fn parse(addr: &str) -> Result<Self, ClusterError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidAddress(addr.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidAddress(addr.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClusterError::InvalidAddress(addr.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Per-node health classification
///
/// `Unknown` is the state before the first probe completes; it counts as
/// healthy when the cluster state is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl NodeHealth {
    pub fn from_probe(ok: bool) -> Self {
        if ok {
            NodeHealth::Healthy
        } else {
            NodeHealth::Unhealthy
        }
    }

    /// Whether the node counts as healthy for reconciliation and notifications
    pub fn is_usable(&self) -> bool {
        !matches!(self, NodeHealth::Unhealthy)
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Unknown => write!(f, "unknown"),
            NodeHealth::Healthy => write!(f, "healthy"),
            NodeHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_and_parse() {
        let node = NodeSpec::parse("10.0.0.5:7001").unwrap();
        assert_eq!(node.id(), "10.0.0.5:7001");
        assert_eq!(node.priority, 1);

        assert!(NodeSpec::parse("10.0.0.5").is_err());
        assert!(NodeSpec::parse(":7001").is_err());
        assert!(NodeSpec::parse("host:notaport").is_err());
    }

    #[test]
    fn test_unknown_counts_as_usable() {
        assert!(NodeHealth::default().is_usable());
        assert!(NodeHealth::Healthy.is_usable());
        assert!(!NodeHealth::Unhealthy.is_usable());
    }

    #[test]
    fn test_password_not_serialized() {
        let node = NodeSpec::new("a", 1).with_password("secret");
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("secret"));
    }
}
