//! Scriptable in-memory cache driver

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use warden::driver::{ConnectOptions, SlotOwnership};
use warden::metadata::TOTAL_SLOTS;
use warden::{CacheDriver, DriverConnector, DriverError, DriverEvent, NodeId};

/// How a node answers probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    Up,
    /// Ping fails with a connection error
    Down,
    /// Ping never completes
    Hang,
    /// Ping succeeds, INFO fails
    StatsFail,
}

const INFO: &str = "\
# Server\r
redis_version:7.2.4\r
\r
# Clients\r
connected_clients:12\r
\r
# Memory\r
used_memory:1048576\r
used_memory_peak:2097152\r
maxmemory:8388608\r
mem_fragmentation_ratio:1.25\r
\r
# Stats\r
instantaneous_ops_per_sec:150\r
instantaneous_input_kbps:3.5\r
instantaneous_output_kbps:7.25\r
\r
# Replication\r
role:master\r
connected_slaves:0\r
";

pub fn cluster_id(addr: &str) -> String {
    format!("id-{}", addr.replace([':', '.'], "-"))
}

pub struct MockDriver {
    nodes: Mutex<BTreeMap<NodeId, NodeBehavior>>,
    slots: Mutex<Vec<SlotOwnership>>,
    connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_enumeration: AtomicBool,
    pub fail_meet: AtomicBool,
    pub meets: Mutex<Vec<(String, u16)>>,
    pub forgets: Mutex<Vec<String>>,
    pub pings: AtomicUsize,
    events: broadcast::Sender<DriverEvent>,
}

impl MockDriver {
    /// Driver whose topology is `addrs`, slots split evenly between them
    pub fn new(addrs: &[&str]) -> Arc<Self> {
        let driver = Arc::new(Self {
            nodes: Mutex::new(
                addrs
                    .iter()
                    .map(|a| (a.to_string(), NodeBehavior::Up))
                    .collect(),
            ),
            slots: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_enumeration: AtomicBool::new(false),
            fail_meet: AtomicBool::new(false),
            meets: Mutex::new(Vec::new()),
            forgets: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            events: broadcast::channel(64).0,
        });
        driver.assign_slots_evenly();
        driver
    }

    pub fn set(&self, addr: &str, behavior: NodeBehavior) {
        self.nodes.lock().insert(addr.to_string(), behavior);
    }

    pub fn assign_slots_evenly(&self) {
        let masters: Vec<NodeId> = self.nodes.lock().keys().cloned().collect();
        let mut slots = Vec::new();
        if !masters.is_empty() {
            let per_node = TOTAL_SLOTS as usize / masters.len();
            for (i, master) in masters.iter().enumerate() {
                let start = i * per_node;
                let end = if i + 1 == masters.len() {
                    TOTAL_SLOTS as usize - 1
                } else {
                    start + per_node - 1
                };
                slots.push(SlotOwnership {
                    start: start as u16,
                    end: end as u16,
                    master: master.clone(),
                    replicas: Vec::new(),
                });
            }
        }
        *self.slots.lock() = slots;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn behavior(&self, node: &str) -> Result<NodeBehavior, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        self.nodes
            .lock()
            .get(node)
            .copied()
            .ok_or_else(|| DriverError::UnknownNode(node.to_string()))
    }
}

#[async_trait]
impl CacheDriver for MockDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        self.emit(DriverEvent::Connect);
        if self.fail_connect.load(Ordering::Acquire) {
            self.emit(DriverEvent::Error("connection refused".into()));
            return Err(DriverError::Connection("connection refused".into()));
        }
        self.connected.store(true, Ordering::Release);
        self.emit(DriverEvent::Ready);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.connected.store(false, Ordering::Release);
        self.emit(DriverEvent::Close);
        Ok(())
    }

    async fn known_nodes(&self) -> Result<Vec<NodeId>, DriverError> {
        if !self.is_connected() || self.fail_enumeration.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        Ok(self.nodes.lock().keys().cloned().collect())
    }

    async fn ping(&self, node: &str) -> Result<(), DriverError> {
        self.pings.fetch_add(1, Ordering::AcqRel);
        match self.behavior(node)? {
            NodeBehavior::Up | NodeBehavior::StatsFail => Ok(()),
            NodeBehavior::Down => Err(DriverError::Connection(format!("{}: refused", node))),
            NodeBehavior::Hang => std::future::pending().await,
        }
    }

    async fn info(&self, node: &str, _section: Option<&str>) -> Result<String, DriverError> {
        match self.behavior(node)? {
            NodeBehavior::Up => Ok(INFO.to_string()),
            NodeBehavior::StatsFail => Err(DriverError::Command("ERR stats unavailable".into())),
            NodeBehavior::Down => Err(DriverError::Connection(format!("{}: refused", node))),
            NodeBehavior::Hang => std::future::pending().await,
        }
    }

    async fn cluster_info(&self) -> Result<String, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let known = self.nodes.lock().len();
        Ok(format!(
            "cluster_state:ok\r\ncluster_slots_assigned:{}\r\ncluster_known_nodes:{}\r\n",
            TOTAL_SLOTS, known
        ))
    }

    async fn cluster_nodes(&self) -> Result<String, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let slots = self.slots.lock().clone();
        let lines: Vec<String> = self
            .nodes
            .lock()
            .iter()
            .map(|(addr, behavior)| {
                let owned: Vec<String> = slots
                    .iter()
                    .filter(|s| &s.master == addr)
                    .map(|s| format!("{}-{}", s.start, s.end))
                    .collect();
                let (flags, link) = match behavior {
                    NodeBehavior::Down | NodeBehavior::Hang => ("master,fail", "disconnected"),
                    _ => ("master", "connected"),
                };
                format!(
                    "{} {}@1{} {} - 0 0 1 {} {}",
                    cluster_id(addr),
                    addr,
                    addr.rsplit(':').next().unwrap_or("0"),
                    flags,
                    link,
                    owned.join(" ")
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn cluster_slots(&self) -> Result<Vec<SlotOwnership>, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        Ok(self.slots.lock().clone())
    }

    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        self.meets.lock().push((host.to_string(), port));
        if self.fail_meet.load(Ordering::Acquire) {
            return Err(DriverError::Command("ERR Invalid node address specified".into()));
        }
        let addr = format!("{}:{}", host, port);
        self.nodes.lock().insert(addr.clone(), NodeBehavior::Up);
        self.emit(DriverEvent::NodeAdded(addr));
        Ok(())
    }

    async fn cluster_forget(&self, cluster_node_id: &str) -> Result<(), DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let addr = self
            .nodes
            .lock()
            .keys()
            .find(|addr| cluster_id(addr) == cluster_node_id)
            .cloned()
            .ok_or_else(|| DriverError::Command(format!("ERR Unknown node {}", cluster_node_id)))?;
        self.forgets.lock().push(cluster_node_id.to_string());
        self.nodes.lock().remove(&addr);
        self.slots.lock().retain(|s| s.master != addr);
        self.emit(DriverEvent::NodeRemoved(addr));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

/// Connector handing out one shared [`MockDriver`]
pub struct MockConnector {
    pub driver: Arc<MockDriver>,
    pub builds: AtomicUsize,
    pub last_options: Mutex<Option<ConnectOptions>>,
}

impl MockConnector {
    pub fn new(driver: Arc<MockDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            builds: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        })
    }
}

impl DriverConnector for MockConnector {
    fn build(&self, options: ConnectOptions) -> Result<Arc<dyn CacheDriver>, DriverError> {
        self.builds.fetch_add(1, Ordering::AcqRel);
        *self.last_options.lock() = Some(options);
        Ok(self.driver.clone())
    }
}
