//! One connected peer: handshake, wire loop, extension plumbing.
//!
//! A `PeerSession` owns the socket and nothing else. Swarm policy (what to
//! request, whom to choke) lives in the torrent session, which drives peers
//! through [`PeerCommand`]s and observes them through [`PeerEvent`]s. A
//! misbehaving peer only ever costs its own connection.

pub mod codec;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, trace, warn};

use self::codec::{BlockInfo, Handshake, HandshakeCodec, Message, PeerCodec};
use super::bencode::Value;

/// Interval between outgoing keep-alives on an otherwise idle link.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Our extension ids advertised in the BEP 10 handshake.
const OUR_UT_METADATA_ID: i64 = 2;
const OUR_UT_PEX_ID: i64 = 3;

/// BEP 9 metadata piece size.
pub const METADATA_PIECE_LEN: usize = 16 * 1024;

/// Everything a peer session reports to its torrent session.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed and verified.
    Connected { addr: SocketAddr, peer_id: [u8; 20] },
    /// The peer's full bitfield (raw wire bytes).
    Bitfield { addr: SocketAddr, bits: Vec<u8> },
    Have { addr: SocketAddr, piece: u32 },
    Choked { addr: SocketAddr },
    Unchoked { addr: SocketAddr },
    InterestChanged { addr: SocketAddr, interested: bool },
    /// A requested (or endgame-duplicated) block arrived.
    Block { addr: SocketAddr, block: BlockInfo, data: Bytes },
    /// The peer wants a block from us.
    BlockRequested { addr: SocketAddr, block: BlockInfo },
    CancelRequested { addr: SocketAddr, block: BlockInfo },
    /// The peer asked for a BEP 9 metadata piece.
    MetadataRequested { addr: SocketAddr, index: u32 },
    /// The peer's extended handshake advertised BEP 9 metadata.
    MetadataAvailable { addr: SocketAddr, size: u32 },
    /// A BEP 9 metadata piece arrived.
    MetadataPiece { addr: SocketAddr, index: u32, data: Bytes },
    /// The peer rejected a metadata request.
    MetadataRejected { addr: SocketAddr, index: u32 },
    /// PEX delivered more swarm addresses.
    PexPeers { addr: SocketAddr, peers: Vec<SocketAddr> },
    /// The peer advertised its DHT port.
    DhtPort { addr: SocketAddr, port: u16 },
    /// The connection is gone; the session must forget this peer.
    Closed { addr: SocketAddr, reason: String },
}

/// Commands the torrent session issues to a peer.
#[derive(Debug)]
pub enum PeerCommand {
    RequestBlocks(Vec<BlockInfo>),
    Cancel(BlockInfo),
    SendHave(u32),
    SendBitfield(Vec<u8>),
    Choke,
    Unchoke,
    SetInterested(bool),
    /// Serve a block the peer requested.
    ServeBlock { block: BlockInfo, data: Bytes },
    /// Request one BEP 9 metadata piece.
    RequestMetadataPiece(u32),
    /// Answer a metadata request we previously surfaced.
    ServeMetadataPiece { index: u32, total_size: u32, data: Bytes },
    Shutdown,
}

/// Cheap handle the torrent session keeps per peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    /// Sends a command; a closed peer ignores it.
    pub fn send(&self, cmd: PeerCommand) {
        let _ = self.cmd_tx.send(cmd);
    }
}

/// Connection direction, for logging and handshake ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Static parameters shared by all peers of one torrent.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub info_hash: [u8; 20],
    pub our_peer_id: [u8; 20],
    /// Our listen port, advertised in the extended handshake.
    pub listen_port: u16,
    /// Size of the info dictionary, advertised for BEP 9 when known.
    pub metadata_size: Option<u32>,
    /// Seconds of silence before the link is dropped.
    pub peer_timeout: Duration,
}

/// Spawns the session task for an outbound connection.
pub fn spawn_outbound(
    addr: SocketAddr,
    ctx: PeerContext,
    event_tx: mpsc::Sender<PeerEvent>,
) -> PeerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle { addr, cmd_tx };
    tokio::spawn(async move {
        let reason = match run_outbound(addr, &ctx, &event_tx, cmd_rx).await {
            Ok(()) => "closed".to_string(),
            Err(e) => e,
        };
        let _ = event_tx.send(PeerEvent::Closed { addr, reason }).await;
    });
    handle
}

/// Spawns the session task for an accepted connection whose handshake was
/// already read by the listener (to route it to the right torrent).
pub fn spawn_inbound(
    addr: SocketAddr,
    socket: TcpStream,
    their_handshake: Handshake,
    ctx: PeerContext,
    event_tx: mpsc::Sender<PeerEvent>,
) -> PeerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle { addr, cmd_tx };
    tokio::spawn(async move {
        let reason = match run_inbound(addr, socket, their_handshake, &ctx, &event_tx, cmd_rx).await
        {
            Ok(()) => "closed".to_string(),
            Err(e) => e,
        };
        let _ = event_tx.send(PeerEvent::Closed { addr, reason }).await;
    });
    handle
}

async fn run_outbound(
    addr: SocketAddr,
    ctx: &PeerContext,
    event_tx: &mpsc::Sender<PeerEvent>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) -> Result<(), String> {
    debug!(%addr, "connecting to peer");
    let socket = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| format!("connect: {e}"))?;

    let mut framed = Framed::new(socket, HandshakeCodec);
    framed
        .send(Handshake::new(ctx.info_hash, ctx.our_peer_id))
        .await
        .map_err(|e| format!("handshake send: {e}"))?;

    let theirs = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .map_err(|_| "handshake timeout".to_string())?
        .ok_or("closed during handshake")?
        .map_err(|e| format!("handshake: {e}"))?;

    finish_handshake(addr, framed, theirs, Direction::Outbound, ctx, event_tx, cmd_rx).await
}

async fn run_inbound(
    addr: SocketAddr,
    socket: TcpStream,
    theirs: Handshake,
    ctx: &PeerContext,
    event_tx: &mpsc::Sender<PeerEvent>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) -> Result<(), String> {
    let mut framed = Framed::new(socket, HandshakeCodec);
    framed
        .send(Handshake::new(ctx.info_hash, ctx.our_peer_id))
        .await
        .map_err(|e| format!("handshake send: {e}"))?;
    finish_handshake(addr, framed, theirs, Direction::Inbound, ctx, event_tx, cmd_rx).await
}

async fn finish_handshake(
    addr: SocketAddr,
    framed: Framed<TcpStream, HandshakeCodec>,
    theirs: Handshake,
    direction: Direction,
    ctx: &PeerContext,
    event_tx: &mpsc::Sender<PeerEvent>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) -> Result<(), String> {
    if theirs.info_hash != ctx.info_hash {
        return Err("info hash mismatch in handshake".into());
    }
    debug!(%addr, ?direction, "handshake complete");

    // Re-frame with the message codec, keeping any already-buffered bytes.
    let old_parts = framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let extensions = theirs.supports_extensions();
    if extensions {
        let payload = extended_handshake_payload(ctx.listen_port, ctx.metadata_size);
        socket
            .send(Message::Extended { id: 0, payload: payload.into() })
            .await
            .map_err(|e| format!("extended handshake: {e}"))?;
    }

    event_tx
        .send(PeerEvent::Connected { addr, peer_id: theirs.peer_id })
        .await
        .map_err(|_| "session gone".to_string())?;

    let mut session = PeerWire {
        addr,
        event_tx: event_tx.clone(),
        their_ut_metadata: None,
        their_ut_pex: None,
    };
    session.run(socket, cmd_rx, ctx.peer_timeout).await
}

/// Wire-loop state for one peer.
struct PeerWire {
    addr: SocketAddr,
    event_tx: mpsc::Sender<PeerEvent>,
    /// The peer's id for ut_metadata messages we send to it.
    their_ut_metadata: Option<u8>,
    /// The peer's id for ut_pex messages we send to it.
    their_ut_pex: Option<u8>,
}

impl PeerWire {
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
        mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
        peer_timeout: Duration,
    ) -> Result<(), String> {
        let (mut sink, mut stream) = socket.split();
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(format!("read: {e}")),
                        None => return Ok(()),
                    };
                    last_heard = Instant::now();
                    trace!(addr = %self.addr, kind = msg.kind(), "peer message");
                    self.handle_message(&mut sink, msg).await?;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    if matches!(cmd, PeerCommand::Shutdown) {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    self.handle_command(&mut sink, cmd).await?;
                }
                _ = keep_alive.tick() => {
                    if last_heard.elapsed() > peer_timeout {
                        return Err("peer timed out".into());
                    }
                    sink.send(Message::KeepAlive).await.map_err(|e| format!("write: {e}"))?;
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        sink: &mut (impl futures::Sink<Message, Error = std::io::Error> + Unpin),
        msg: Message,
    ) -> Result<(), String> {
        let addr = self.addr;
        let event = match msg {
            Message::KeepAlive => None,
            Message::Choke => Some(PeerEvent::Choked { addr }),
            Message::Unchoke => Some(PeerEvent::Unchoked { addr }),
            Message::Interested => Some(PeerEvent::InterestChanged { addr, interested: true }),
            Message::NotInterested => {
                Some(PeerEvent::InterestChanged { addr, interested: false })
            }
            Message::Have(piece) => Some(PeerEvent::Have { addr, piece }),
            Message::Bitfield(bits) => Some(PeerEvent::Bitfield { addr, bits }),
            Message::Request(block) => Some(PeerEvent::BlockRequested { addr, block }),
            Message::Cancel(block) => Some(PeerEvent::CancelRequested { addr, block }),
            Message::Piece { piece, begin, data } => Some(PeerEvent::Block {
                addr,
                block: BlockInfo { piece, begin, length: data.len() as u32 },
                data,
            }),
            Message::Port(port) => Some(PeerEvent::DhtPort { addr, port }),
            Message::Extended { id, payload } => {
                return self.handle_extended(sink, id, &payload).await;
            }
        };
        if let Some(event) = event {
            self.event_tx.send(event).await.map_err(|_| "session gone".to_string())?;
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        _sink: &mut (impl futures::Sink<Message, Error = std::io::Error> + Unpin),
        id: u8,
        payload: &Bytes,
    ) -> Result<(), String> {
        let addr = self.addr;
        match id {
            // Extended handshake: learn the peer's extension ids.
            0 => {
                let Ok(dict) = Value::decode(payload) else {
                    warn!(%addr, "undecodable extended handshake");
                    return Ok(());
                };
                if let Some(m) = dict.get(b"m") {
                    self.their_ut_metadata =
                        m.get_int(b"ut_metadata").and_then(|v| u8::try_from(v).ok());
                    self.their_ut_pex = m.get_int(b"ut_pex").and_then(|v| u8::try_from(v).ok());
                }
                if let Some(size) = dict.get_int(b"metadata_size").and_then(|v| u32::try_from(v).ok())
                    && self.their_ut_metadata.is_some()
                {
                    self.send_event(PeerEvent::MetadataAvailable { addr, size }).await?;
                }
            }
            // Our advertised ut_metadata id.
            id if i64::from(id) == OUR_UT_METADATA_ID => {
                self.handle_metadata_message(payload).await?;
            }
            // Our advertised ut_pex id.
            id if i64::from(id) == OUR_UT_PEX_ID => {
                if let Ok(dict) = Value::decode(payload)
                    && let Some(added) = dict.get_bytes(b"added")
                {
                    let peers = parse_compact_peers(added);
                    if !peers.is_empty() {
                        self.send_event(PeerEvent::PexPeers { addr, peers }).await?;
                    }
                }
            }
            other => {
                trace!(%addr, id = other, "ignoring unknown extended message");
            }
        }
        Ok(())
    }

    /// BEP 9: the payload is a bencoded header followed by raw piece bytes.
    async fn handle_metadata_message(&mut self, payload: &Bytes) -> Result<(), String> {
        let addr = self.addr;
        // The header is self-delimiting; find its length by decoding a prefix.
        let Some((header, rest)) = split_bencode_prefix(payload) else {
            warn!(%addr, "malformed metadata message");
            return Ok(());
        };
        let msg_type = header.get_int(b"msg_type").unwrap_or(-1);
        let index = header.get_int(b"piece").and_then(|v| u32::try_from(v).ok()).unwrap_or(0);
        match msg_type {
            // request: surfaced so the session can serve (or reject) it
            0 => {
                self.send_event(PeerEvent::MetadataRequested { addr, index }).await?;
            }
            // data
            1 => {
                self.send_event(PeerEvent::MetadataPiece {
                    addr,
                    index,
                    data: Bytes::copy_from_slice(rest),
                })
                .await?;
            }
            // reject
            2 => {
                self.send_event(PeerEvent::MetadataRejected { addr, index }).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        sink: &mut (impl futures::Sink<Message, Error = std::io::Error> + Unpin),
        cmd: PeerCommand,
    ) -> Result<(), String> {
        let result: Result<(), std::io::Error> = match cmd {
            PeerCommand::RequestBlocks(blocks) => {
                let mut res = Ok(());
                for block in blocks {
                    res = sink.send(Message::Request(block)).await;
                    if res.is_err() {
                        break;
                    }
                }
                res
            }
            PeerCommand::Cancel(block) => sink.send(Message::Cancel(block)).await,
            PeerCommand::SendHave(piece) => sink.send(Message::Have(piece)).await,
            PeerCommand::SendBitfield(bits) => sink.send(Message::Bitfield(bits)).await,
            PeerCommand::Choke => sink.send(Message::Choke).await,
            PeerCommand::Unchoke => sink.send(Message::Unchoke).await,
            PeerCommand::SetInterested(true) => sink.send(Message::Interested).await,
            PeerCommand::SetInterested(false) => sink.send(Message::NotInterested).await,
            PeerCommand::ServeBlock { block, data } => {
                sink.send(Message::Piece { piece: block.piece, begin: block.begin, data }).await
            }
            PeerCommand::RequestMetadataPiece(index) => {
                if let Some(ext_id) = self.their_ut_metadata {
                    let header = metadata_header(0, index, None);
                    sink.send(Message::Extended { id: ext_id, payload: header.into() }).await
                } else {
                    Ok(())
                }
            }
            PeerCommand::ServeMetadataPiece { index, total_size, data } => {
                if let Some(ext_id) = self.their_ut_metadata {
                    let mut payload = metadata_header(1, index, Some(total_size));
                    payload.extend_from_slice(&data);
                    sink.send(Message::Extended { id: ext_id, payload: payload.into() }).await
                } else {
                    Ok(())
                }
            }
            PeerCommand::Shutdown => return Ok(()),
        };
        result.map_err(|e| format!("write: {e}"))
    }

    async fn send_event(&self, event: PeerEvent) -> Result<(), String> {
        self.event_tx.send(event).await.map_err(|_| "session gone".to_string())
    }
}

/// Builds our BEP 10 extended handshake payload.
fn extended_handshake_payload(listen_port: u16, metadata_size: Option<u32>) -> Vec<u8> {
    let mut m = std::collections::BTreeMap::new();
    m.insert(b"ut_metadata".to_vec(), Value::Int(OUR_UT_METADATA_ID));
    m.insert(b"ut_pex".to_vec(), Value::Int(OUR_UT_PEX_ID));
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"m".to_vec(), Value::Dict(m));
    dict.insert(b"p".to_vec(), Value::Int(i64::from(listen_port)));
    if let Some(size) = metadata_size {
        dict.insert(b"metadata_size".to_vec(), Value::Int(i64::from(size)));
    }
    dict.insert(b"v".to_vec(), Value::from("fetchd 0.1"));
    Value::Dict(dict).encode()
}

/// Builds a BEP 9 message header.
fn metadata_header(msg_type: i64, piece: u32, total_size: Option<u32>) -> Vec<u8> {
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
    dict.insert(b"piece".to_vec(), Value::Int(i64::from(piece)));
    if let Some(size) = total_size {
        dict.insert(b"total_size".to_vec(), Value::Int(i64::from(size)));
    }
    Value::Dict(dict).encode()
}

/// Splits a buffer into a leading bencode value and the remaining bytes.
fn split_bencode_prefix(payload: &[u8]) -> Option<(Value, &[u8])> {
    // Grow the prefix until it parses; header dicts are tiny so this stays
    // cheap. The common case succeeds on the first full-dict boundary.
    for end in memchr_all_e(payload) {
        if let Ok(value) = Value::decode(&payload[..end]) {
            return Some((value, &payload[end..]));
        }
    }
    None
}

/// Candidate end positions: one past each 'e' byte.
fn memchr_all_e(payload: &[u8]) -> impl Iterator<Item = usize> + '_ {
    payload
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'e')
        .map(|(i, _)| i + 1)
}

/// Parses a compact IPv4 peer list (6 bytes per peer).
#[must_use]
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}
