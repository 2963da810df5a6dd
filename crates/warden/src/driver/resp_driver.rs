//! RESP/TCP driver
//!
//! One lazily (re)established connection per node. Commands are strictly
//! request/response, bounded by the command timeout; a connection that
//! errors, times out or is abandoned mid-request is dropped and re-dialled
//! on next use.

use async_trait::async_trait;
use parking_lot::RwLock;
use resp::{ReplyReader, RespValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    parse_cluster_nodes, CacheDriver, ConnectOptions, DriverConnector, DriverError, DriverEvent,
    SlotOwnership, DRIVER_EVENT_CAPACITY,
};
use crate::metadata::{NodeId, NodeSpec};

struct Connection {
    reader: ReplyReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn roundtrip(&mut self, frame: &RespValue) -> Result<RespValue, DriverError> {
        resp::write_value(&mut self.writer, frame)
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(self.reader.read_reply().await?)
    }
}

struct NodeHandle {
    spec: NodeSpec,
    conn: Mutex<Option<Connection>>,
    /// Set once a connection has existed, so a re-dial is reported as a reconnect
    dialled: AtomicBool,
}

impl NodeHandle {
    fn new(spec: NodeSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            conn: Mutex::new(None),
            dialled: AtomicBool::new(false),
        })
    }
}

/// `CacheDriver` over plain TCP
pub struct RespDriver {
    options: ConnectOptions,
    nodes: RwLock<BTreeMap<NodeId, Arc<NodeHandle>>>,
    connected: AtomicBool,
    events: broadcast::Sender<DriverEvent>,
}

impl RespDriver {
    pub fn new(options: ConnectOptions) -> Self {
        let nodes = options
            .nodes
            .iter()
            .map(|spec| (spec.id(), NodeHandle::new(spec.clone())))
            .collect();
        let (events, _) = broadcast::channel(DRIVER_EVENT_CAPACITY);
        Self {
            options,
            nodes: RwLock::new(nodes),
            connected: AtomicBool::new(false),
            events,
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&self, node: &str) -> Result<Arc<NodeHandle>, DriverError> {
        self.nodes
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| DriverError::UnknownNode(node.to_string()))
    }

    /// Add a node discovered at runtime, inheriting seed credentials
    fn track(&self, addr: &str) -> bool {
        let Ok(mut spec) = NodeSpec::parse(addr) else {
            return false;
        };
        if let Some(seed) = self.options.nodes.first() {
            spec.password = seed.password.clone();
            spec.db = seed.db;
        }
        let mut nodes = self.nodes.write();
        if nodes.contains_key(addr) {
            return false;
        }
        nodes.insert(addr.to_string(), NodeHandle::new(spec));
        true
    }

    async fn dial(&self, spec: &NodeSpec) -> Result<Connection, DriverError> {
        let connect_timeout = self.options.connect_timeout;
        let stream = timeout(connect_timeout, TcpStream::connect((spec.host.as_str(), spec.port)))
            .await
            .map_err(|_| DriverError::Timeout(connect_timeout))?
            .map_err(|e| DriverError::Connection(format!("{}: {}", spec.id(), e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::Connection(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: ReplyReader::new(read_half),
            writer: write_half,
        };

        if let Some(password) = &spec.password {
            conn.roundtrip(&RespValue::command(["AUTH", password.as_str()]))
                .await?
                .into_result()?;
        }
        if let Some(db) = spec.db {
            conn.roundtrip(&RespValue::command(["SELECT".to_string(), db.to_string()]))
                .await?
                .into_result()?;
        }
        Ok(conn)
    }

    async fn dial_with_attempts(&self, spec: &NodeSpec) -> Result<Connection, DriverError> {
        let mut last_err = DriverError::Connection(format!("{}: not attempted", spec.id()));
        for attempt in 1..=self.options.connect_attempts.max(1) {
            match self.dial(spec).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Dial {} attempt {} failed: {}", spec.id(), attempt, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Send one command to one node
    async fn command<I, A>(&self, node: &str, args: I) -> Result<RespValue, DriverError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        if !self.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        let handle = self.handle(node)?;
        let frame = RespValue::command(args);
        let command_timeout = self.options.command_timeout;

        let mut guard = handle.conn.lock().await;
        // The connection stays out of the slot while a request is in flight,
        // so a caller dropping this future mid-reply also drops the stream.
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                if handle.dialled.load(Ordering::Acquire) {
                    self.emit(DriverEvent::Reconnecting(node.to_string()));
                }
                let conn = self.dial(&handle.spec).await?;
                handle.dialled.store(true, Ordering::Release);
                conn
            }
        };

        match timeout(command_timeout, conn.roundtrip(&frame)).await {
            Ok(Ok(reply)) => {
                *guard = Some(conn);
                Ok(reply.into_result()?)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DriverError::Timeout(command_timeout)),
        }
    }

    /// Run a cluster-scoped command on the first node that answers
    async fn any_node<A>(&self, args: &[A]) -> Result<RespValue, DriverError>
    where
        A: AsRef<[u8]>,
    {
        let candidates: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        let mut last_err = DriverError::NotConnected;
        for node in candidates {
            match self.command(&node, args.iter()).await {
                Ok(reply) => return Ok(reply),
                Err(e @ DriverError::Command(_)) => return Err(e),
                Err(e) => {
                    debug!("Node {} unavailable for cluster command: {}", node, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn text_reply<A>(&self, args: &[A]) -> Result<String, DriverError>
    where
        A: AsRef<[u8]>,
    {
        self.any_node(args)
            .await?
            .as_text()
            .ok_or_else(|| DriverError::Protocol("expected text reply".to_string()))
    }

    /// Discover cluster members through the first reachable seed
    async fn discover(&self) {
        match self.text_reply(&["CLUSTER", "NODES"]).await {
            Ok(text) => {
                for entry in parse_cluster_nodes(&text) {
                    // handshake entries carry no usable address yet
                    if entry.addr.starts_with(':') {
                        continue;
                    }
                    if self.track(&entry.addr) {
                        info!("Discovered cluster node {}", entry.addr);
                        self.emit(DriverEvent::NodeAdded(entry.addr));
                    }
                }
            }
            Err(e) => debug!("Cluster discovery skipped: {}", e),
        }
    }
}

#[async_trait]
impl CacheDriver for RespDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        self.connected.store(true, Ordering::Release);
        self.emit(DriverEvent::Connect);

        let handles: Vec<Arc<NodeHandle>> = self.nodes.read().values().cloned().collect();
        let mut reachable = 0usize;
        for handle in handles {
            match self.dial_with_attempts(&handle.spec).await {
                Ok(conn) => {
                    *handle.conn.lock().await = Some(conn);
                    handle.dialled.store(true, Ordering::Release);
                    reachable += 1;
                }
                Err(e) => warn!("Seed {} unreachable: {}", handle.spec.id(), e),
            }
        }

        if reachable == 0 {
            self.connected.store(false, Ordering::Release);
            let err = DriverError::Connection("no seed node reachable".to_string());
            self.emit(DriverEvent::Error(err.to_string()));
            return Err(err);
        }

        self.discover().await;
        info!("Driver connected: {} seed(s) reachable", reachable);
        self.emit(DriverEvent::Ready);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.connected.store(false, Ordering::Release);
        let handles: Vec<Arc<NodeHandle>> = self.nodes.read().values().cloned().collect();
        for handle in handles {
            handle.conn.lock().await.take();
        }
        self.emit(DriverEvent::Close);
        Ok(())
    }

    async fn known_nodes(&self) -> Result<Vec<NodeId>, DriverError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        Ok(self.nodes.read().keys().cloned().collect())
    }

    async fn ping(&self, node: &str) -> Result<(), DriverError> {
        let reply = self.command(node, ["PING"]).await?;
        match reply.as_text().as_deref() {
            Some("PONG") => Ok(()),
            _ => Err(DriverError::Protocol(format!("unexpected PING reply: {:?}", reply))),
        }
    }

    async fn info(&self, node: &str, section: Option<&str>) -> Result<String, DriverError> {
        let mut args = vec!["INFO"];
        args.extend(section);
        self.command(node, args)
            .await?
            .as_text()
            .ok_or_else(|| DriverError::Protocol("expected INFO text".to_string()))
    }

    async fn cluster_info(&self) -> Result<String, DriverError> {
        self.text_reply(&["CLUSTER", "INFO"]).await
    }

    async fn cluster_nodes(&self) -> Result<String, DriverError> {
        self.text_reply(&["CLUSTER", "NODES"]).await
    }

    async fn cluster_slots(&self) -> Result<Vec<SlotOwnership>, DriverError> {
        let reply = self.any_node(&["CLUSTER", "SLOTS"]).await?;
        parse_slots(reply)
    }

    async fn cluster_meet(&self, host: &str, port: u16) -> Result<(), DriverError> {
        let port_arg = port.to_string();
        self.any_node(&["CLUSTER", "MEET", host, port_arg.as_str()])
            .await?;
        let addr = format!("{}:{}", host, port);
        if self.track(&addr) {
            self.emit(DriverEvent::NodeAdded(addr));
        }
        Ok(())
    }

    async fn cluster_forget(&self, cluster_node_id: &str) -> Result<(), DriverError> {
        let topology = parse_cluster_nodes(&self.cluster_nodes().await?);
        let target = topology
            .iter()
            .find(|e| e.id == cluster_node_id)
            .map(|e| e.addr.clone())
            .ok_or_else(|| DriverError::UnknownNode(cluster_node_id.to_string()))?;

        // Every remaining member has to forget the node, or gossip brings it back
        let peers: Vec<NodeId> = self
            .nodes
            .read()
            .keys()
            .filter(|addr| **addr != target)
            .cloned()
            .collect();
        let mut forgotten = 0usize;
        let mut last_err = DriverError::NotConnected;
        for peer in peers {
            match self.command(&peer, ["CLUSTER", "FORGET", cluster_node_id]).await {
                Ok(_) => forgotten += 1,
                Err(e) => {
                    warn!("Node {} did not forget {}: {}", peer, cluster_node_id, e);
                    last_err = e;
                }
            }
        }
        if forgotten == 0 {
            return Err(last_err);
        }

        if self.nodes.write().remove(&target).is_some() {
            self.emit(DriverEvent::NodeRemoved(target));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

/// Decode a `CLUSTER SLOTS` reply
fn parse_slots(reply: RespValue) -> Result<Vec<SlotOwnership>, DriverError> {
    let invalid = || DriverError::Protocol("malformed CLUSTER SLOTS reply".to_string());

    let entries = reply.into_array().ok_or_else(invalid)?;
    let mut owners = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut fields = entry.into_array().ok_or_else(invalid)?.into_iter();
        let start = fields.next().and_then(|v| v.as_integer()).ok_or_else(invalid)?;
        let end = fields.next().and_then(|v| v.as_integer()).ok_or_else(invalid)?;
        let mut members = fields.map(|node| {
            let node = node.into_array().ok_or_else(invalid)?;
            let host = node.first().and_then(RespValue::as_text).ok_or_else(invalid)?;
            let port = node.get(1).and_then(RespValue::as_integer).ok_or_else(invalid)?;
            Ok::<_, DriverError>(format!("{}:{}", host, port))
        });
        let master = members.next().ok_or_else(invalid)??;
        let replicas = members.collect::<Result<Vec<_>, _>>()?;
        owners.push(SlotOwnership {
            start: u16::try_from(start).map_err(|_| invalid())?,
            end: u16::try_from(end).map_err(|_| invalid())?,
            master,
            replicas,
        });
    }
    Ok(owners)
}

/// Builds [`RespDriver`]s
#[derive(Debug, Clone, Default)]
pub struct RespConnector;

impl DriverConnector for RespConnector {
    fn build(&self, options: ConnectOptions) -> Result<Arc<dyn CacheDriver>, DriverError> {
        if options.nodes.is_empty() {
            return Err(DriverError::Connection("no nodes configured".to_string()));
        }
        Ok(Arc::new(RespDriver::new(options)))
    }
}
