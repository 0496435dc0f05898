//! Mainline DHT client (BEP 5).
//!
//! The engine runs one DHT node shared by all torrents. It keeps a small
//! routing table fed by bootstrap nodes and query traffic, answers pings
//! so it is a polite citizen, and serves two calls for the sessions:
//! `get_peers` lookups and `announce_peer`.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::bencode::Value;

/// Lookup fan-out per round.
const LOOKUP_ALPHA: usize = 8;

/// Iterative lookup rounds before settling for what we have.
const LOOKUP_ROUNDS: usize = 3;

/// Per-round wait for responses.
const ROUND_TIMEOUT: Duration = Duration::from_secs(2);

/// Routing table size cap. Client role only; no bucket splitting.
const MAX_NODES: usize = 512;

/// Node ids and info hashes share the 160-bit keyspace.
type NodeId = [u8; 20];

/// Commands a torrent session can issue.
#[derive(Debug)]
pub enum DhtCommand {
    /// Find peers for an info hash.
    GetPeers {
        info_hash: NodeId,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    /// Announce that we serve an info hash on the given TCP port.
    Announce { info_hash: NodeId, port: u16 },
    /// Feed a node learned out of band (PORT messages, config).
    AddNode(SocketAddr),
}

/// Cheap cloneable handle to the DHT task.
#[derive(Debug, Clone)]
pub struct DhtHandle {
    tx: mpsc::Sender<DhtCommand>,
}

impl DhtHandle {
    /// Runs a peer lookup; an unreachable DHT yields no peers.
    pub async fn get_peers(&self, info_hash: NodeId) -> Vec<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DhtCommand::GetPeers { info_hash, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Fire-and-forget announce.
    pub async fn announce(&self, info_hash: NodeId, port: u16) {
        let _ = self.tx.send(DhtCommand::Announce { info_hash, port }).await;
    }

    /// Adds a candidate routing-table node.
    pub async fn add_node(&self, addr: SocketAddr) {
        let _ = self.tx.send(DhtCommand::AddNode(addr)).await;
    }
}

/// Spawns the DHT node task. Returns `None` when the socket cannot bind;
/// peer discovery then falls back to trackers alone.
pub async fn spawn(bootstrap: Vec<String>, listen_port: u16) -> Option<DhtHandle> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, listen_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "DHT socket bind failed, continuing without DHT");
            return None;
        }
    };
    let (tx, rx) = mpsc::channel(64);
    let node = DhtNode {
        node_id: rand::random(),
        socket,
        nodes: Vec::new(),
        next_transaction: 1,
    };
    tokio::spawn(node.run(bootstrap, rx));
    Some(DhtHandle { tx })
}

#[derive(Debug, Clone, Copy)]
struct NodeEntry {
    id: NodeId,
    addr: SocketAddr,
    last_seen: Instant,
}

struct DhtNode {
    node_id: NodeId,
    socket: UdpSocket,
    nodes: Vec<NodeEntry>,
    next_transaction: u16,
}

impl DhtNode {
    async fn run(mut self, bootstrap: Vec<String>, mut rx: mpsc::Receiver<DhtCommand>) {
        self.bootstrap(&bootstrap).await;

        let mut buf = vec![0u8; 2048];
        let mut refresh = tokio::time::interval(Duration::from_secs(300));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    match cmd {
                        DhtCommand::GetPeers { info_hash, reply } => {
                            let (peers, _) = self.lookup(info_hash, None).await;
                            let _ = reply.send(peers);
                        }
                        DhtCommand::Announce { info_hash, port } => {
                            let _ = self.lookup(info_hash, Some(port)).await;
                        }
                        DhtCommand::AddNode(addr) => {
                            self.ping(addr).await;
                        }
                    }
                }
                incoming = self.socket.recv_from(&mut buf) => {
                    if let Ok((n, from)) = incoming {
                        self.handle_datagram(&buf[..n], from).await;
                    }
                }
                _ = refresh.tick() => {
                    self.evict_stale();
                    if self.nodes.len() < LOOKUP_ALPHA {
                        self.bootstrap(&bootstrap).await;
                    }
                }
            }
        }
    }

    async fn bootstrap(&mut self, bootstrap: &[String]) {
        for host in bootstrap {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => {
                    for addr in addrs.filter(SocketAddr::is_ipv4) {
                        self.send_find_node(addr, self.node_id).await;
                    }
                }
                Err(e) => trace!(host, error = %e, "bootstrap resolve failed"),
            }
        }
    }

    /// Iterative get_peers; optionally announces with the received tokens.
    async fn lookup(&mut self, info_hash: NodeId, announce_port: Option<u16>) -> (Vec<SocketAddr>, usize) {
        let mut peers: Vec<SocketAddr> = Vec::new();
        let mut queried: Vec<SocketAddr> = Vec::new();
        // (node, token) pairs eligible for announce_peer.
        let mut tokens: Vec<(SocketAddr, Vec<u8>)> = Vec::new();

        for _round in 0..LOOKUP_ROUNDS {
            let mut targets = self.closest(info_hash, LOOKUP_ALPHA * 2);
            targets.retain(|addr| !queried.contains(addr));
            targets.truncate(LOOKUP_ALPHA);
            if targets.is_empty() {
                break;
            }

            let mut pending: HashMap<Vec<u8>, SocketAddr> = HashMap::new();
            for addr in targets {
                let tid = self.fresh_transaction();
                let query = build_query(&tid, "get_peers", {
                    let mut args = BTreeMap::new();
                    args.insert(b"id".to_vec(), Value::Bytes(self.node_id.to_vec()));
                    args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
                    args
                });
                if self.socket.send_to(&query, addr).await.is_ok() {
                    pending.insert(tid, addr);
                    queried.push(addr);
                }
            }

            let deadline = Instant::now() + ROUND_TIMEOUT;
            let mut buf = vec![0u8; 2048];
            while !pending.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Ok(Ok((n, from))) =
                    tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await
                else {
                    break;
                };
                let Ok(msg) = Value::decode(&buf[..n]) else { continue };
                let tid = msg.get_bytes(b"t").map(<[u8]>::to_vec);
                match tid.and_then(|t| pending.remove(&t)) {
                    Some(_) => {
                        if let Some(response) = msg.get(b"r") {
                            self.absorb_response(response, from, &mut peers);
                            if let Some(token) = response.get_bytes(b"token") {
                                tokens.push((from, token.to_vec()));
                            }
                        }
                    }
                    // Not part of this lookup: handle as regular traffic.
                    None => self.handle_datagram(&buf[..n], from).await,
                }
            }
        }

        if let Some(port) = announce_port {
            for (addr, token) in &tokens {
                let tid = self.fresh_transaction();
                let query = build_query(&tid, "announce_peer", {
                    let mut args = BTreeMap::new();
                    args.insert(b"id".to_vec(), Value::Bytes(self.node_id.to_vec()));
                    args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
                    args.insert(b"port".to_vec(), Value::Int(i64::from(port)));
                    args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
                    args
                });
                let _ = self.socket.send_to(&query, addr).await;
            }
        }

        peers.sort_unstable();
        peers.dedup();
        debug!(peers = peers.len(), "DHT lookup finished");
        (peers, tokens.len())
    }

    /// Pulls peers and closer nodes out of a get_peers response.
    fn absorb_response(&mut self, response: &Value, from: SocketAddr, peers: &mut Vec<SocketAddr>) {
        if let Some(id) = node_id_from(response) {
            self.touch_node(id, from);
        }
        if let Some(values) = response.get_list(b"values") {
            for value in values {
                if let Some(compact) = value.as_bytes() {
                    peers.extend(super::peer::parse_compact_peers(compact));
                }
            }
        }
        if let Some(nodes) = response.get_bytes(b"nodes") {
            for chunk in nodes.chunks_exact(26) {
                let mut id = [0u8; 20];
                id.copy_from_slice(&chunk[..20]);
                let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
                let port = u16::from_be_bytes([chunk[24], chunk[25]]);
                if port != 0 {
                    self.touch_node(id, SocketAddr::from((ip, port)));
                }
            }
        }
    }

    /// Handles unsolicited traffic: queries from other nodes and stray
    /// responses (which still feed the routing table).
    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let Ok(msg) = Value::decode(datagram) else { return };
        match msg.get_str(b"y") {
            Some("q") => {
                let tid = msg.get_bytes(b"t").unwrap_or(b"00").to_vec();
                if let Some(args) = msg.get(b"a")
                    && let Some(id) = node_id_from(args)
                {
                    self.touch_node(id, from);
                }
                // Answer pings and node queries minimally; we never store
                // announce data (client role).
                let query = msg.get_str(b"q").unwrap_or_default();
                if matches!(query, "ping" | "find_node" | "get_peers") {
                    let mut response = BTreeMap::new();
                    response.insert(b"id".to_vec(), Value::Bytes(self.node_id.to_vec()));
                    if query != "ping" {
                        response.insert(b"nodes".to_vec(), Value::Bytes(Vec::new()));
                    }
                    let reply = build_response(&tid, response);
                    let _ = self.socket.send_to(&reply, from).await;
                }
            }
            Some("r") => {
                if let Some(response) = msg.get(b"r") {
                    let mut scratch = Vec::new();
                    self.absorb_response(response, from, &mut scratch);
                }
            }
            _ => {}
        }
    }

    async fn ping(&mut self, addr: SocketAddr) {
        let tid = self.fresh_transaction();
        let query = build_query(&tid, "ping", {
            let mut args = BTreeMap::new();
            args.insert(b"id".to_vec(), Value::Bytes(self.node_id.to_vec()));
            args
        });
        let _ = self.socket.send_to(&query, addr).await;
    }

    async fn send_find_node(&mut self, addr: SocketAddr, target: NodeId) {
        let tid = self.fresh_transaction();
        let query = build_query(&tid, "find_node", {
            let mut args = BTreeMap::new();
            args.insert(b"id".to_vec(), Value::Bytes(self.node_id.to_vec()));
            args.insert(b"target".to_vec(), Value::Bytes(target.to_vec()));
            args
        });
        let _ = self.socket.send_to(&query, addr).await;
    }

    fn touch_node(&mut self, id: NodeId, addr: SocketAddr) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.addr == addr) {
            existing.id = id;
            existing.last_seen = Instant::now();
            return;
        }
        if self.nodes.len() >= MAX_NODES {
            // Replace the stalest entry.
            if let Some(oldest) = self.nodes.iter_mut().min_by_key(|n| n.last_seen) {
                *oldest = NodeEntry { id, addr, last_seen: Instant::now() };
            }
            return;
        }
        self.nodes.push(NodeEntry { id, addr, last_seen: Instant::now() });
    }

    fn evict_stale(&mut self) {
        let cutoff = Duration::from_secs(30 * 60);
        self.nodes.retain(|n| n.last_seen.elapsed() < cutoff);
    }

    fn closest(&self, target: NodeId, count: usize) -> Vec<SocketAddr> {
        let mut scored: Vec<(NodeId, SocketAddr)> =
            self.nodes.iter().map(|n| (n.id, n.addr)).collect();
        scored.sort_by_key(|(id, _)| xor_distance(*id, target));
        scored.into_iter().take(count).map(|(_, addr)| addr).collect()
    }

    fn fresh_transaction(&mut self) -> Vec<u8> {
        let tid = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        tid.to_be_bytes().to_vec()
    }
}

fn node_id_from(dict: &Value) -> Option<NodeId> {
    let bytes = dict.get_bytes(b"id")?;
    (bytes.len() == 20).then(|| {
        let mut id = [0u8; 20];
        id.copy_from_slice(bytes);
        id
    })
}

/// XOR metric over the 160-bit keyspace.
fn xor_distance(a: NodeId, b: NodeId) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn build_query(tid: &[u8], name: &str, args: BTreeMap<Vec<u8>, Value>) -> Vec<u8> {
    let mut msg = BTreeMap::new();
    msg.insert(b"a".to_vec(), Value::Dict(args));
    msg.insert(b"q".to_vec(), Value::from(name));
    msg.insert(b"t".to_vec(), Value::Bytes(tid.to_vec()));
    msg.insert(b"y".to_vec(), Value::from("q"));
    Value::Dict(msg).encode()
}

fn build_response(tid: &[u8], response: BTreeMap<Vec<u8>, Value>) -> Vec<u8> {
    let mut msg = BTreeMap::new();
    msg.insert(b"r".to_vec(), Value::Dict(response));
    msg.insert(b"t".to_vec(), Value::Bytes(tid.to_vec()));
    msg.insert(b"y".to_vec(), Value::from("r"));
    Value::Dict(msg).encode()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_distance_orders_by_closeness() {
        let target = [0u8; 20];
        let near = {
            let mut id = [0u8; 20];
            id[19] = 1;
            id
        };
        let far = [0xff; 20];
        assert!(xor_distance(near, target) < xor_distance(far, target));
    }

    #[test]
    fn test_query_message_shape() {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(vec![1; 20]));
        let encoded = build_query(b"aa", "ping", args);
        let msg = Value::decode(&encoded).unwrap();
        assert_eq!(msg.get_str(b"y"), Some("q"));
        assert_eq!(msg.get_str(b"q"), Some("ping"));
        assert_eq!(msg.get_bytes(b"t"), Some(b"aa".as_slice()));
        assert_eq!(msg.get(b"a").unwrap().get_bytes(b"id").unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_node_answers_ping() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node_addr = node_socket.local_addr().unwrap();
        let node = DhtNode {
            node_id: [7; 20],
            socket: node_socket,
            nodes: Vec::new(),
            next_transaction: 1,
        };
        // Keep the command channel open so the node task stays alive.
        let (_tx, rx) = mpsc::channel(1);
        tokio::spawn(node.run(Vec::new(), rx));

        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(vec![9; 20]));
        let ping = build_query(b"xy", "ping", args);
        socket.send_to(&ping, node_addr).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Value::decode(&buf[..n]).unwrap();
        assert_eq!(reply.get_str(b"y"), Some("r"));
        assert_eq!(reply.get_bytes(b"t"), Some(b"xy".as_slice()));
        assert_eq!(reply.get(b"r").unwrap().get_bytes(b"id"), Some([7u8; 20].as_slice()));
    }

    #[tokio::test]
    async fn test_routing_table_caps_and_replaces() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut node = DhtNode {
            node_id: [0; 20],
            socket,
            nodes: Vec::new(),
            next_transaction: 1,
        };
        for i in 0..(MAX_NODES + 10) {
            let addr: SocketAddr =
                format!("10.0.{}.{}:6881", i / 256, i % 256).parse().unwrap();
            node.touch_node(rand::random(), addr);
        }
        assert_eq!(node.nodes.len(), MAX_NODES);
    }
}
