//! Per-download torrent orchestration.
//!
//! One session owns one swarm: metadata acquisition (BEP 9 for magnets),
//! peer discovery (trackers, DHT, LPD, PEX), the request pipeline with
//! rarest-first and endgame, piece verification, choking, and seeding up
//! to the configured ratio. Peers are driven through the channel pair
//! defined in [`super::peer`]; the controller observes the session through
//! [`WorkerUpdate`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use super::dht::DhtHandle;
use super::disk::{TorrentDisk, verify_block_data};
use super::listener::{IncomingPeer, SwarmHooks, SwarmRegistry};
use super::lpd::LpdHandle;
use super::magnet::MagnetLink;
use super::metainfo::{Metainfo, Sha1Hash, info_hash};
use super::peer::codec::BlockInfo;
use super::peer::{
    METADATA_PIECE_LEN, PeerCommand, PeerEvent, PeerHandle, PeerContext, spawn_inbound,
    spawn_outbound,
};
use super::piece_picker::{PieceBits, PiecePicker};
use super::tracker::{Announce, AnnounceEvent, TrackerList};
use crate::config::TorrentConfig;
use crate::error::{EngineError, ErrorKind};
use crate::limiter::LimiterRegistry;
use crate::record::DownloadId;
use crate::worker::{ProgressSnapshot, ResolvedInfo, WorkerContext, WorkerUpdate};

/// Wire block size (16 KiB).
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Outbound connection attempts per maintenance tick.
const CONNECTS_PER_TICK: usize = 5;

/// Regular unchoke slots; one optimistic slot comes on top.
const UNCHOKE_SLOTS: usize = 3;

/// Choke review cadence; the optimistic slot rotates every third review.
const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// DHT lookup/announce cadence.
const DHT_INTERVAL: Duration = Duration::from_secs(300);

/// Strikes before a peer that contributed to corrupt pieces is dropped.
const MAX_HASH_STRIKES: u32 = 3;

/// Engine-level services shared by all torrent sessions.
#[derive(Debug)]
pub struct SwarmServices {
    pub config: TorrentConfig,
    pub max_peers: usize,
    pub seed_ratio: f64,
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    pub registry: SwarmRegistry,
    pub http: reqwest::Client,
    pub dht: Option<DhtHandle>,
    pub lpd: Option<LpdHandle>,
    pub limiters: Arc<LimiterRegistry>,
}

/// What the session starts from.
#[derive(Debug)]
pub enum TorrentInput {
    Metainfo(Box<Metainfo>),
    Magnet(MagnetLink),
}

/// Session parameters from the controller.
#[derive(Debug)]
pub struct TorrentParams {
    pub input: TorrentInput,
    pub save_dir: PathBuf,
    pub sequential: bool,
    /// Persisted have-bitfield to resume from.
    pub resume_have: Option<Vec<u8>>,
    /// Extra tracker tiers (user tracker list).
    pub extra_trackers: Vec<String>,
}

/// Live peer description for `get_peers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePeer {
    pub addr: String,
    pub peer_id: Option<String>,
    pub download_speed: u64,
    pub upload_speed: u64,
    /// Fraction of pieces the peer advertises, 0.0–1.0.
    pub progress: f64,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

/// Per-file description for `get_torrent_files`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFileInfo {
    pub index: usize,
    pub path: String,
    pub length: u64,
    pub wanted: bool,
}

/// Queries the controller can put to a running session.
#[derive(Debug)]
pub enum SessionQuery {
    Peers(oneshot::Sender<Vec<LivePeer>>),
    Files(oneshot::Sender<Vec<TorrentFileInfo>>),
    SelectFiles(Vec<usize>, oneshot::Sender<bool>),
}

/// State of one in-progress piece.
struct Assembly {
    piece: u32,
    length: u32,
    buffer: Vec<u8>,
    received: Vec<bool>,
    /// Which peers each block was requested from (endgame may fan out).
    requested_from: Vec<Vec<SocketAddr>>,
    contributors: HashSet<SocketAddr>,
}

impl Assembly {
    fn new(piece: u32, length: u32) -> Self {
        let blocks = length.div_ceil(BLOCK_LEN) as usize;
        Self {
            piece,
            length,
            buffer: vec![0u8; length as usize],
            received: vec![false; blocks],
            requested_from: vec![Vec::new(); blocks],
            contributors: HashSet::new(),
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        let offset = block as u32 * BLOCK_LEN;
        (self.length - offset).min(BLOCK_LEN)
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    /// Next block to request from `addr`: unreceived, and either never
    /// requested or (in endgame) not yet requested from this peer.
    fn next_block(&self, addr: SocketAddr, endgame: bool) -> Option<usize> {
        (0..self.received.len()).find(|&b| {
            !self.received[b]
                && if endgame {
                    !self.requested_from[b].contains(&addr)
                } else {
                    self.requested_from[b].is_empty()
                }
        })
    }
}

/// Session-side view of one connected peer.
struct SwarmPeer {
    handle: PeerHandle,
    peer_id: Option<[u8; 20]>,
    bits: PieceBits,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    outstanding: Vec<BlockInfo>,
    downloaded: u64,
    uploaded: u64,
    down_rate: u64,
    up_rate: u64,
    last_downloaded: u64,
    last_uploaded: u64,
    supports_metadata: bool,
}

impl SwarmPeer {
    fn new(handle: PeerHandle, piece_count: usize) -> Self {
        let mut bits = PieceBits::new();
        bits.resize(piece_count, false);
        Self {
            handle,
            peer_id: None,
            bits,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            down_rate: 0,
            up_rate: 0,
            last_downloaded: 0,
            last_uploaded: 0,
            supports_metadata: false,
        }
    }

    fn is_seed(&self, piece_count: usize) -> bool {
        piece_count > 0 && self.bits.count_ones() == piece_count
    }
}

/// Removes the registry entry when the session exits.
struct RegistryGuard {
    registry: SwarmRegistry,
    info_hash: Sha1Hash,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.info_hash);
    }
}

/// Runs one torrent to completion (including seeding) or failure.
///
/// Sends [`WorkerUpdate::Finished`] unless the worker was cancelled.
#[instrument(skip_all, fields(id = %ctx.id))]
pub async fn run(
    params: TorrentParams,
    services: Arc<SwarmServices>,
    ctx: WorkerContext,
    query_rx: mpsc::Receiver<SessionQuery>,
) {
    let id = ctx.id.clone();
    let mut session = Session::new(params, services, ctx);
    match session.run_inner(query_rx).await {
        Outcome::Completed => {
            session.ctx.send(WorkerUpdate::Finished { id, result: Ok(()) }).await;
        }
        Outcome::Failed(error) => {
            session.ctx.send(WorkerUpdate::Finished { id, result: Err(error) }).await;
        }
        Outcome::Cancelled => {}
    }
    session.shutdown_peers();
}

enum Outcome {
    Completed,
    Failed(EngineError),
    Cancelled,
}

struct Session {
    ctx: WorkerContext,
    services: Arc<SwarmServices>,
    save_dir: PathBuf,
    sequential: bool,
    resume_have: Option<Vec<u8>>,

    info_hash: Sha1Hash,
    display_name: String,
    meta: Option<Metainfo>,
    disk: Option<Arc<TorrentDisk>>,
    picker: Option<PiecePicker>,
    /// Which files are wanted (parallel to `meta.files`).
    wanted_files: Vec<bool>,

    trackers: TrackerList,
    peer_tx: mpsc::Sender<PeerEvent>,
    peers: HashMap<SocketAddr, SwarmPeer>,
    candidates: VecDeque<SocketAddr>,
    known_addrs: HashSet<SocketAddr>,
    strikes: HashMap<SocketAddr, u32>,
    assemblies: HashMap<u32, Assembly>,

    /// BEP 9 assembly state for magnet downloads.
    metadata_size: Option<u32>,
    metadata_pieces: Vec<Option<Bytes>>,
    /// Canonical info dictionary, served to metadata-requesting peers.
    metadata_blob: Option<Arc<Vec<u8>>>,

    completed_bytes: u64,
    session_downloaded: u64,
    session_uploaded: u64,
    last_downloaded: u64,
    last_uploaded: u64,
    announced_started: bool,
    announced_complete: bool,
    finalized: bool,
    choke_rounds: u32,
    optimistic: Option<SocketAddr>,
}

impl Session {
    fn new(params: TorrentParams, services: Arc<SwarmServices>, ctx: WorkerContext) -> Self {
        let (info_hash, display_name, meta, tracker_tiers) = match params.input {
            TorrentInput::Metainfo(meta) => {
                let tiers = meta.trackers.clone();
                (meta.info_hash, meta.name.clone(), Some(*meta), tiers)
            }
            TorrentInput::Magnet(link) => {
                let name = link
                    .display_name
                    .clone()
                    .unwrap_or_else(|| link.info_hash_hex());
                // Magnet trackers form one tier each, preserving order.
                let tiers = link.trackers.iter().map(|t| vec![t.clone()]).collect();
                (link.info_hash, name, None, tiers)
            }
        };

        let mut trackers = TrackerList::new(&tracker_tiers, &services.http);
        if !params.extra_trackers.is_empty() {
            trackers.add_tier(&params.extra_trackers, &services.http);
        }

        let (peer_tx, _) = mpsc::channel(1);
        let mut session = Self {
            ctx,
            services,
            save_dir: params.save_dir,
            sequential: params.sequential,
            resume_have: params.resume_have,
            info_hash,
            display_name,
            meta: None,
            disk: None,
            picker: None,
            wanted_files: Vec::new(),
            trackers,
            peer_tx,
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            known_addrs: HashSet::new(),
            strikes: HashMap::new(),
            assemblies: HashMap::new(),
            metadata_size: None,
            metadata_pieces: Vec::new(),
            metadata_blob: None,
            completed_bytes: 0,
            session_downloaded: 0,
            session_uploaded: 0,
            last_downloaded: 0,
            last_uploaded: 0,
            announced_started: false,
            announced_complete: false,
            finalized: false,
            choke_rounds: 0,
            optimistic: None,
        };
        if let Some(meta) = meta {
            session.meta = Some(meta);
        }
        session
    }

    async fn run_inner(&mut self, mut query_rx: mpsc::Receiver<SessionQuery>) -> Outcome {
        let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(256);
        self.peer_tx = peer_tx;

        let (incoming_tx, mut incoming_rx) = mpsc::channel::<IncomingPeer>(16);
        let (discovered_tx, mut discovered_rx) = mpsc::channel::<SocketAddr>(64);
        self.services.registry.insert(
            self.info_hash,
            SwarmHooks { incoming: incoming_tx, discovered: discovered_tx },
        );
        let _registry_guard = RegistryGuard {
            registry: Arc::clone(&self.services.registry),
            info_hash: self.info_hash,
        };
        if let Some(lpd) = &self.services.lpd {
            lpd.register(hex::encode(self.info_hash)).await;
        }

        // Metainfo input can set up the data phase immediately; magnets
        // wait for BEP 9.
        if self.meta.is_some()
            && let Err(error) = self.init_data_phase().await
        {
            return Outcome::Failed(error);
        }

        let mut cancel = self.ctx.clone();
        let mut queries_open = true;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut choke_tick = tokio::time::interval(CHOKE_INTERVAL);
        choke_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dht_tick = tokio::time::interval(DHT_INTERVAL);
        dht_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First announce fires immediately; the interval is adjusted from
        // tracker responses.
        let mut announce_at = tokio::time::Instant::now();

        loop {
            let announce_sleep = tokio::time::sleep_until(announce_at);
            tokio::select! {
                _ = cancel.cancelled_wait() => {
                    self.announce(AnnounceEvent::Stopped).await;
                    return Outcome::Cancelled;
                }
                event = peer_rx.recv() => {
                    let Some(event) = event else { continue };
                    if let Err(error) = self.handle_peer_event(event).await {
                        self.announce(AnnounceEvent::Stopped).await;
                        return Outcome::Failed(error);
                    }
                    if let Some(outcome) = self.check_finished().await {
                        return outcome;
                    }
                }
                incoming = incoming_rx.recv() => {
                    if let Some(peer) = incoming {
                        self.accept_inbound(peer);
                    }
                }
                discovered = discovered_rx.recv() => {
                    if let Some(addr) = discovered {
                        self.add_candidate(addr);
                    }
                }
                query = query_rx.recv(), if queries_open => {
                    match query {
                        Some(query) => self.answer_query(query),
                        None => queries_open = false,
                    }
                }
                _ = announce_sleep => {
                    let interval = self.announce_cycle().await;
                    announce_at = tokio::time::Instant::now() + interval;
                }
                _ = dht_tick.tick() => {
                    self.dht_cycle().await;
                }
                _ = choke_tick.tick() => {
                    self.review_chokes();
                }
                _ = tick.tick() => {
                    self.maintenance_tick().await;
                    if let Some(outcome) = self.check_finished().await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Transitions from metadata acquisition to piece transfer.
    async fn init_data_phase(&mut self) -> Result<(), EngineError> {
        let meta = self.meta.as_ref().ok_or_else(|| {
            EngineError::fatal(ErrorKind::Unknown, "data phase without metainfo")
        })?;

        let disk = Arc::new(TorrentDisk::create(meta, &self.save_dir)?);
        let mut picker = PiecePicker::new(
            meta.piece_count(),
            self.sequential,
            self.services.config.enable_endgame,
        );
        self.wanted_files = vec![true; meta.files.len()];

        // Trust the persisted bitfield only after the bytes on disk re-hash
        // correctly; anything else is demoted back to missing.
        if let Some(resume) = self.resume_have.take() {
            picker.restore_have(&resume);
            for index in 0..meta.piece_count() {
                if picker.has_piece(index)
                    && !disk.verify_piece(index, meta.pieces[index]).await?
                {
                    picker.mark_lost(index);
                }
            }
        }

        self.completed_bytes = (0..meta.piece_count())
            .filter(|&i| picker.has_piece(i))
            .map(|i| u64::from(meta.piece_len(i)))
            .sum();
        self.display_name = meta.name.clone();

        self.ctx
            .send(WorkerUpdate::Resolved {
                id: self.ctx.id.clone(),
                info: ResolvedInfo {
                    name: Some(meta.name.clone()),
                    total: Some(meta.total_size),
                    files: disk.relative_paths(),
                    piece_length: Some(meta.piece_length),
                    ..ResolvedInfo::default()
                },
            })
            .await;

        info!(
            name = %meta.name,
            pieces = meta.piece_count(),
            total = meta.total_size,
            "torrent data phase ready"
        );
        self.metadata_blob = meta_info_blob(meta).map(Arc::new);
        self.disk = Some(disk);
        self.picker = Some(picker);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            info_hash: self.info_hash,
            our_peer_id: self.services.peer_id,
            listen_port: self.services.listen_port,
            metadata_size: self.metadata_blob.as_ref().map(|b| b.len() as u32),
            peer_timeout: self.services.config.peer_timeout(),
        }
    }

    fn add_candidate(&mut self, addr: SocketAddr) {
        if self.known_addrs.insert(addr) {
            self.candidates.push_back(addr);
        }
    }

    fn accept_inbound(&mut self, peer: IncomingPeer) {
        if self.peers.len() >= self.services.max_peers {
            trace!(addr = %peer.addr, "swarm full, dropping inbound peer");
            return;
        }
        self.known_addrs.insert(peer.addr);
        let handle = spawn_inbound(
            peer.addr,
            peer.socket,
            peer.handshake,
            self.peer_context(),
            self.peer_tx.clone(),
        );
        let piece_count = self.piece_count();
        self.peers.insert(peer.addr, SwarmPeer::new(handle, piece_count));
    }

    fn connect_candidates(&mut self) {
        let mut budget = CONNECTS_PER_TICK.min(
            self.services.max_peers.saturating_sub(self.peers.len()),
        );
        while budget > 0 {
            let Some(addr) = self.candidates.pop_front() else { break };
            if self.peers.contains_key(&addr)
                || self.strikes.get(&addr).copied().unwrap_or(0) >= MAX_HASH_STRIKES
            {
                continue;
            }
            let handle = spawn_outbound(addr, self.peer_context(), self.peer_tx.clone());
            let piece_count = self.piece_count();
            self.peers.insert(addr, SwarmPeer::new(handle, piece_count));
            budget -= 1;
        }
    }

    fn piece_count(&self) -> usize {
        self.meta.as_ref().map(Metainfo::piece_count).unwrap_or(0)
    }

    fn shutdown_peers(&mut self) {
        for peer in self.peers.values() {
            peer.handle.send(PeerCommand::Shutdown);
        }
        self.peers.clear();
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), EngineError> {
        match event {
            PeerEvent::Connected { addr, peer_id } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_id = Some(peer_id);
                    if let Some(picker) = &self.picker {
                        let bitfield = picker.have_bitfield();
                        if bitfield.iter().any(|&b| b != 0) {
                            peer.handle.send(PeerCommand::SendBitfield(bitfield));
                        }
                    }
                }
            }
            PeerEvent::Bitfield { addr, bits } => {
                let piece_count = self.piece_count();
                if let Some(peer) = self.peers.get_mut(&addr) {
                    let mut incoming = PieceBits::from_slice(&bits);
                    // Before metadata resolves the piece count is unknown;
                    // keep the raw bits and size them later.
                    if piece_count > 0 {
                        incoming.resize(piece_count, false);
                        if let Some(picker) = self.picker.as_mut() {
                            picker.peer_connected(&incoming);
                        }
                    }
                    peer.bits = incoming;
                }
                self.update_interest(addr);
            }
            PeerEvent::Have { addr, piece } => {
                if let Some(peer) = self.peers.get_mut(&addr)
                    && (piece as usize) < peer.bits.len()
                {
                    peer.bits.set(piece as usize, true);
                    if let Some(picker) = self.picker.as_mut() {
                        picker.peer_has(piece as usize);
                    }
                }
                self.update_interest(addr);
            }
            PeerEvent::Choked { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                    // Outstanding requests will not be served while choked.
                    let abandoned = std::mem::take(&mut peer.outstanding);
                    self.release_requests(addr, &abandoned);
                }
            }
            PeerEvent::Unchoked { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                }
                self.fill_requests(addr);
            }
            PeerEvent::InterestChanged { addr, interested } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = interested;
                }
            }
            PeerEvent::Block { addr, block, data } => {
                self.handle_block(addr, block, data).await?;
            }
            PeerEvent::BlockRequested { addr, block } => {
                self.serve_block(addr, block).await?;
            }
            PeerEvent::CancelRequested { .. } => {
                // Blocks are served immediately on request, so a late cancel
                // is a no-op (and cancel must be idempotent anyway).
            }
            PeerEvent::MetadataAvailable { addr, size } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.supports_metadata = true;
                }
                self.start_metadata_exchange(addr, size);
            }
            PeerEvent::MetadataPiece { addr, index, data } => {
                self.handle_metadata_piece(addr, index, data).await?;
            }
            PeerEvent::MetadataRejected { addr, index } => {
                debug!(%addr, index, "metadata piece rejected, trying another peer");
                self.request_missing_metadata(Some(addr));
            }
            PeerEvent::MetadataRequested { addr, index } => {
                self.serve_metadata(addr, index);
            }
            PeerEvent::PexPeers { addr, peers } => {
                if self.services.config.enable_pex {
                    trace!(%addr, count = peers.len(), "PEX peers");
                    for peer in peers {
                        self.add_candidate(peer);
                    }
                }
            }
            PeerEvent::DhtPort { addr, port } => {
                if let Some(dht) = &self.services.dht {
                    dht.add_node(SocketAddr::new(addr.ip(), port)).await;
                }
            }
            PeerEvent::Closed { addr, reason } => {
                trace!(%addr, reason, "peer closed");
                if let Some(peer) = self.peers.remove(&addr) {
                    if let Some(picker) = self.picker.as_mut() {
                        picker.peer_disconnected(&peer.bits);
                    }
                    self.release_requests(addr, &peer.outstanding);
                }
                if self.optimistic == Some(addr) {
                    self.optimistic = None;
                }
            }
        }
        Ok(())
    }

    /// Returns abandoned blocks to their assemblies so they are re-picked.
    fn release_requests(&mut self, addr: SocketAddr, blocks: &[BlockInfo]) {
        for block in blocks {
            if let Some(assembly) = self.assemblies.get_mut(&block.piece) {
                let index = (block.begin / BLOCK_LEN) as usize;
                if let Some(requested) = assembly.requested_from.get_mut(index) {
                    requested.retain(|&a| a != addr);
                }
            }
        }
        // Fully unrequested, unreceived assemblies with no contributors can
        // be dropped so the picker may hand the piece to someone else.
        let empty: Vec<u32> = self
            .assemblies
            .values()
            .filter(|a| {
                !a.received.iter().any(|&r| r)
                    && a.requested_from.iter().all(Vec::is_empty)
            })
            .map(|a| a.piece)
            .collect();
        for piece in empty {
            self.assemblies.remove(&piece);
            if let Some(picker) = self.picker.as_mut() {
                picker.requeue(piece as usize);
            }
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(picker) = &self.picker else { return };
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        let interesting = picker.is_interesting(&peer.bits);
        if interesting != peer.am_interested {
            peer.am_interested = interesting;
            peer.handle.send(PeerCommand::SetInterested(interesting));
        }
        if interesting && !peer.peer_choking {
            self.fill_requests(addr);
        }
    }

    /// Keeps the request pipeline to `addr` full.
    fn fill_requests(&mut self, addr: SocketAddr) {
        let max_pending = self.services.config.max_pending_requests;
        let Some(picker) = self.picker.as_mut() else { return };
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        if peer.peer_choking || !peer.am_interested {
            return;
        }

        let endgame = picker.in_endgame();
        let mut to_request: Vec<BlockInfo> = Vec::new();
        while peer.outstanding.len() + to_request.len() < max_pending {
            // Continue existing assemblies first to finish pieces sooner.
            let mut next = None;
            for assembly in self.assemblies.values_mut() {
                if !peer.bits.get(assembly.piece as usize).map(|b| *b).unwrap_or(false) {
                    continue;
                }
                if let Some(block) = assembly.next_block(addr, endgame) {
                    assembly.requested_from[block].push(addr);
                    next = Some(BlockInfo {
                        piece: assembly.piece,
                        begin: block as u32 * BLOCK_LEN,
                        length: assembly.block_len(block),
                    });
                    break;
                }
            }

            if next.is_none() {
                // Start a fresh piece for this peer.
                let Some(meta) = self.meta.as_ref() else { break };
                match picker.pick(&peer.bits) {
                    Some(piece) => {
                        let assembly = self
                            .assemblies
                            .entry(piece as u32)
                            .or_insert_with(|| {
                                Assembly::new(piece as u32, meta.piece_len(piece))
                            });
                        if let Some(block) = assembly.next_block(addr, endgame) {
                            assembly.requested_from[block].push(addr);
                            next = Some(BlockInfo {
                                piece: assembly.piece,
                                begin: block as u32 * BLOCK_LEN,
                                length: assembly.block_len(block),
                            });
                        }
                    }
                    None => break,
                }
            }

            match next {
                Some(block) => to_request.push(block),
                None => break,
            }
        }

        if !to_request.is_empty() {
            peer.outstanding.extend_from_slice(&to_request);
            peer.handle.send(PeerCommand::RequestBlocks(to_request));
        }
    }

    async fn handle_block(
        &mut self,
        addr: SocketAddr,
        block: BlockInfo,
        data: Bytes,
    ) -> Result<(), EngineError> {
        // Rate-limit inbound payload before processing it further.
        self.services
            .limiters
            .acquire_download(&self.ctx.id, u64::from(block.length))
            .await;

        let Some(peer) = self.peers.get_mut(&addr) else { return Ok(()) };
        let was_outstanding = peer.outstanding.iter().position(|b| *b == block);
        match was_outstanding {
            Some(pos) => {
                peer.outstanding.remove(pos);
            }
            None => {
                // Unsolicited data; ignore the bytes but keep the link.
                trace!(%addr, ?block, "unrequested block dropped");
                return Ok(());
            }
        }
        peer.downloaded += u64::from(block.length);
        self.session_downloaded += u64::from(block.length);

        let block_index = (block.begin / BLOCK_LEN) as usize;
        let mut completed_piece = None;
        if let Some(assembly) = self.assemblies.get_mut(&block.piece) {
            if !assembly.received.get(block_index).copied().unwrap_or(true) {
                let start = block.begin as usize;
                let end = start + data.len();
                if end <= assembly.buffer.len() {
                    assembly.buffer[start..end].copy_from_slice(&data);
                    assembly.received[block_index] = true;
                    assembly.contributors.insert(addr);

                    // Endgame: cancel the duplicates we fanned out.
                    let others: Vec<SocketAddr> = assembly.requested_from[block_index]
                        .iter()
                        .copied()
                        .filter(|&a| a != addr)
                        .collect();
                    for other in others {
                        if let Some(other_peer) = self.peers.get_mut(&other) {
                            other_peer.outstanding.retain(|b| *b != block);
                            other_peer.handle.send(PeerCommand::Cancel(block));
                        }
                    }
                }
            }
            if assembly.is_complete() {
                completed_piece = Some(block.piece);
            }
        }

        if let Some(piece) = completed_piece {
            self.finish_piece(piece).await?;
        }
        self.fill_requests(addr);
        Ok(())
    }

    /// Verifies, persists, and announces a completed piece.
    async fn finish_piece(&mut self, piece: u32) -> Result<(), EngineError> {
        let Some(assembly) = self.assemblies.remove(&piece) else { return Ok(()) };
        let Some(meta) = self.meta.as_ref() else { return Ok(()) };
        let expected = meta.pieces[piece as usize];

        let (data, ok) = verify_block_data(assembly.buffer, expected).await;
        if !ok {
            warn!(piece, "piece failed verification, requeueing");
            for contributor in &assembly.contributors {
                let strikes = self.strikes.entry(*contributor).or_insert(0);
                *strikes += 1;
                if *strikes >= MAX_HASH_STRIKES
                    && let Some(peer) = self.peers.get(contributor)
                {
                    debug!(addr = %contributor, "dropping peer after repeated bad pieces");
                    peer.handle.send(PeerCommand::Shutdown);
                }
            }
            if let Some(picker) = self.picker.as_mut() {
                picker.requeue(piece as usize);
            }
            return Ok(());
        }

        let disk = self
            .disk
            .as_ref()
            .ok_or_else(|| EngineError::fatal(ErrorKind::Unknown, "no disk"))?;
        disk.write_piece(piece as usize, data).await?;

        let piece_len = u64::from(assembly.length);
        self.completed_bytes += piece_len;
        if let Some(picker) = self.picker.as_mut() {
            picker.mark_have(piece as usize);
        }

        // `have` goes out only after the piece is verified and persisted.
        for peer in self.peers.values() {
            peer.handle.send(PeerCommand::SendHave(piece));
        }
        if let Some(picker) = &self.picker {
            self.ctx
                .send(WorkerUpdate::Bitfield {
                    id: self.ctx.id.clone(),
                    have: picker.have_bitfield(),
                })
                .await;
        }
        trace!(piece, "piece verified and stored");

        // Interest may drop now that a piece is complete.
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);
        }
        Ok(())
    }

    /// Serves a block to a peer we have unchoked.
    async fn serve_block(&mut self, addr: SocketAddr, block: BlockInfo) -> Result<(), EngineError> {
        let Some(meta) = self.meta.as_ref() else { return Ok(()) };
        let Some(peer) = self.peers.get(&addr) else { return Ok(()) };
        if peer.am_choking {
            trace!(%addr, "request from choked peer ignored");
            return Ok(());
        }
        let has = self
            .picker
            .as_ref()
            .map(|p| p.has_piece(block.piece as usize))
            .unwrap_or(false);
        if !has || block.length > BLOCK_LEN * 2 {
            return Ok(());
        }

        let offset =
            u64::from(block.piece) * u64::from(meta.piece_length) + u64::from(block.begin);
        let Some(disk) = self.disk.as_ref() else { return Ok(()) };
        let data = disk.read_span(offset, block.length as usize).await?;

        self.services
            .limiters
            .acquire_upload(&self.ctx.id, u64::from(block.length))
            .await;

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.uploaded += u64::from(block.length);
            self.session_uploaded += u64::from(block.length);
            peer.handle.send(PeerCommand::ServeBlock { block, data: data.into() });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // BEP 9 metadata exchange
    // ------------------------------------------------------------------

    fn start_metadata_exchange(&mut self, addr: SocketAddr, size: u32) {
        if self.meta.is_some() || size == 0 || size > 32 * 1024 * 1024 {
            return;
        }
        if self.metadata_size.is_none() {
            let pieces = (size as usize).div_ceil(METADATA_PIECE_LEN);
            self.metadata_size = Some(size);
            self.metadata_pieces = vec![None; pieces];
            debug!(size, pieces, "starting metadata exchange");
        }
        let _ = addr;
        self.request_missing_metadata(None);
    }

    /// Requests every missing metadata piece, spreading over peers that
    /// support the extension (skipping `exclude`).
    fn request_missing_metadata(&mut self, exclude: Option<SocketAddr>) {
        if self.meta.is_some() || self.metadata_pieces.is_empty() {
            return;
        }
        let supporters: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(addr, p)| p.supports_metadata && Some(**addr) != exclude)
            .map(|(addr, _)| *addr)
            .collect();
        if supporters.is_empty() {
            return;
        }
        let mut next = 0usize;
        for (index, slot) in self.metadata_pieces.iter().enumerate() {
            if slot.is_none() {
                let addr = supporters[next % supporters.len()];
                next += 1;
                if let Some(peer) = self.peers.get(&addr) {
                    peer.handle.send(PeerCommand::RequestMetadataPiece(index as u32));
                }
            }
        }
    }

    async fn handle_metadata_piece(
        &mut self,
        addr: SocketAddr,
        index: u32,
        data: Bytes,
    ) -> Result<(), EngineError> {
        if self.meta.is_some() {
            return Ok(());
        }
        let Some(slot) = self.metadata_pieces.get_mut(index as usize) else { return Ok(()) };
        if slot.is_none() {
            *slot = Some(data);
        }
        if !self.metadata_pieces.iter().all(Option::is_some) {
            return Ok(());
        }

        let expected_size = self.metadata_size.unwrap_or(0) as usize;
        let mut blob = Vec::with_capacity(expected_size);
        for piece in &self.metadata_pieces {
            if let Some(piece) = piece {
                blob.extend_from_slice(piece);
            }
        }
        blob.truncate(expected_size);

        // The SHA-1 of the info dictionary is the magnet's identity; a
        // mismatch means a poisoned swarm and is fatal.
        if info_hash(&blob) != self.info_hash {
            return Err(EngineError::hash_mismatch(format!(
                "metadata from swarm does not match info hash {} (last peer {addr})",
                hex::encode(self.info_hash)
            )));
        }

        let meta = Metainfo::from_info_dict(&blob).map_err(|e| {
            EngineError::fatal(ErrorKind::BencodeParse, format!("metadata: {e}"))
        })?;
        info!(name = %meta.name, "metadata acquired from swarm");
        self.meta = Some(meta);
        self.metadata_pieces.clear();
        self.init_data_phase().await?;

        // Size the bitfields received before the piece count was known and
        // register their availability now.
        let piece_count = self.piece_count();
        for peer in self.peers.values_mut() {
            peer.bits.resize(piece_count, false);
            if let Some(picker) = self.picker.as_mut() {
                picker.peer_connected(&peer.bits);
            }
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr);
        }
        Ok(())
    }

    fn serve_metadata(&mut self, addr: SocketAddr, index: u32) {
        let Some(blob) = self.metadata_blob.as_ref() else { return };
        let start = index as usize * METADATA_PIECE_LEN;
        if start >= blob.len() {
            return;
        }
        let end = (start + METADATA_PIECE_LEN).min(blob.len());
        if let Some(peer) = self.peers.get(&addr) {
            peer.handle.send(PeerCommand::ServeMetadataPiece {
                index,
                total_size: blob.len() as u32,
                data: Bytes::copy_from_slice(&blob[start..end]),
            });
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    async fn announce_cycle(&mut self) -> Duration {
        if self.trackers.is_empty() {
            return Duration::from_secs(self.services.config.tracker_update_interval);
        }
        let event = if !self.announced_started {
            AnnounceEvent::Started
        } else {
            AnnounceEvent::None
        };
        let request = self.announce_request(event);
        match self.trackers.announce(&request).await {
            Ok(response) => {
                self.announced_started = true;
                for addr in response.peers {
                    self.add_candidate(addr);
                }
                self.connect_candidates();
                let floor = response.min_interval.unwrap_or(Duration::from_secs(60));
                response.interval.max(floor)
            }
            Err(error) => {
                // Tracker failures never fail the download.
                debug!(error = %error, "announce cycle failed");
                Duration::from_secs(self.services.config.tracker_update_interval.min(300))
            }
        }
    }

    async fn announce(&mut self, event: AnnounceEvent) {
        if self.trackers.is_empty() {
            return;
        }
        let request = self.announce_request(event);
        if let Err(error) = self.trackers.announce(&request).await {
            debug!(error = %error, "announce failed");
        }
    }

    fn announce_request(&self, event: AnnounceEvent) -> Announce {
        let total = self.meta.as_ref().map(|m| m.total_size).unwrap_or(0);
        Announce {
            info_hash: self.info_hash,
            peer_id: self.services.peer_id,
            port: self.services.listen_port,
            uploaded: self.session_uploaded,
            downloaded: self.session_downloaded,
            left: total.saturating_sub(self.completed_bytes),
            event,
        }
    }

    async fn dht_cycle(&mut self) {
        let Some(dht) = self.services.dht.clone() else { return };
        if !self.services.config.enable_dht {
            return;
        }
        let peers = dht.get_peers(self.info_hash).await;
        for addr in peers {
            self.add_candidate(addr);
        }
        dht.announce(self.info_hash, self.services.listen_port).await;
        self.connect_candidates();
    }

    // ------------------------------------------------------------------
    // Choking
    // ------------------------------------------------------------------

    /// Every 10 s: unchoke the top-3 interested peers by transfer rate,
    /// plus one optimistic slot rotated every 30 s.
    fn review_chokes(&mut self) {
        self.choke_rounds += 1;
        let seeding = self.picker.as_ref().map(PiecePicker::is_complete).unwrap_or(false);

        let ranked = rank_for_unchoke(
            self.peers
                .iter()
                .map(|(addr, p)| (*addr, if seeding { p.up_rate } else { p.down_rate }, p.peer_interested)),
        );
        let mut unchoked: HashSet<SocketAddr> = ranked.into_iter().take(UNCHOKE_SLOTS).collect();

        // Rotate the optimistic slot every third review.
        if self.choke_rounds % 3 == 1 || self.optimistic.is_none() {
            let choked_interested: Vec<SocketAddr> = self
                .peers
                .iter()
                .filter(|(addr, p)| p.peer_interested && !unchoked.contains(*addr))
                .map(|(addr, _)| *addr)
                .collect();
            self.optimistic = pick_random(&choked_interested);
        }
        if let Some(optimistic) = self.optimistic {
            unchoked.insert(optimistic);
        }

        for (addr, peer) in &mut self.peers {
            let should_unchoke = unchoked.contains(addr);
            if should_unchoke && peer.am_choking {
                peer.am_choking = false;
                peer.handle.send(PeerCommand::Unchoke);
            } else if !should_unchoke && !peer.am_choking {
                peer.am_choking = true;
                peer.handle.send(PeerCommand::Choke);
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic upkeep
    // ------------------------------------------------------------------

    async fn maintenance_tick(&mut self) {
        // Refresh per-peer and session rates from the cumulative counters.
        for peer in self.peers.values_mut() {
            peer.down_rate = peer.downloaded - peer.last_downloaded;
            peer.up_rate = peer.uploaded - peer.last_uploaded;
            peer.last_downloaded = peer.downloaded;
            peer.last_uploaded = peer.uploaded;
        }
        let down_speed = self.session_downloaded - self.last_downloaded;
        let up_speed = self.session_uploaded - self.last_uploaded;
        self.last_downloaded = self.session_downloaded;
        self.last_uploaded = self.session_uploaded;

        self.connect_candidates();
        self.request_missing_metadata(None);
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.fill_requests(addr);
        }

        let piece_count = self.piece_count();
        let seeders = self.peers.values().filter(|p| p.is_seed(piece_count)).count() as u32;
        self.ctx
            .send(WorkerUpdate::Progress {
                id: self.ctx.id.clone(),
                snapshot: ProgressSnapshot {
                    completed: self.completed_bytes,
                    total: self.meta.as_ref().map(|m| m.total_size),
                    download_speed: down_speed,
                    upload_speed: up_speed,
                    connections: self.peers.len() as u32,
                    seeders,
                },
            })
            .await;
    }

    /// Handles completion and the seed-ratio exit condition.
    async fn check_finished(&mut self) -> Option<Outcome> {
        let complete = self.picker.as_ref().map(PiecePicker::is_complete).unwrap_or(false);
        if !complete {
            return None;
        }

        if !self.finalized {
            if let Some(disk) = self.disk.as_ref()
                && let Err(error) = disk.finalize()
            {
                return Some(Outcome::Failed(error));
            }
            self.finalized = true;
            info!(name = %self.display_name, "torrent download complete, seeding");
        }
        if !self.announced_complete {
            self.announced_complete = true;
            self.announce(AnnounceEvent::Completed).await;
        }

        let total = self.meta.as_ref().map(|m| m.total_size).unwrap_or(0);
        let ratio = if total == 0 {
            f64::INFINITY
        } else {
            self.session_uploaded as f64 / total as f64
        };
        if ratio >= self.services.seed_ratio {
            info!(ratio, "seed ratio reached, finishing");
            self.announce(AnnounceEvent::Stopped).await;
            if let Some(lpd) = &self.services.lpd {
                lpd.unregister(hex::encode(self.info_hash)).await;
            }
            return Some(Outcome::Completed);
        }
        None
    }

    // ------------------------------------------------------------------
    // Controller queries
    // ------------------------------------------------------------------

    fn answer_query(&mut self, query: SessionQuery) {
        match query {
            SessionQuery::Peers(reply) => {
                let piece_count = self.piece_count().max(1);
                let peers = self
                    .peers
                    .iter()
                    .map(|(addr, p)| LivePeer {
                        addr: addr.to_string(),
                        peer_id: p.peer_id.map(hex::encode),
                        download_speed: p.down_rate,
                        upload_speed: p.up_rate,
                        progress: p.bits.count_ones() as f64 / piece_count as f64,
                        am_choking: p.am_choking,
                        am_interested: p.am_interested,
                        peer_choking: p.peer_choking,
                        peer_interested: p.peer_interested,
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            SessionQuery::Files(reply) => {
                let files = self
                    .meta
                    .as_ref()
                    .map(|meta| {
                        meta.files
                            .iter()
                            .enumerate()
                            .map(|(index, file)| TorrentFileInfo {
                                index,
                                path: file.path.to_string_lossy().into_owned(),
                                length: file.length,
                                wanted: self.wanted_files.get(index).copied().unwrap_or(true),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(files);
            }
            SessionQuery::SelectFiles(indices, reply) => {
                let ok = self.select_files(&indices);
                let _ = reply.send(ok);
            }
        }
    }

    /// Applies a file selection: wanted pieces are those overlapping any
    /// selected file.
    fn select_files(&mut self, indices: &[usize]) -> bool {
        let Some(meta) = self.meta.as_ref() else { return false };
        if indices.iter().any(|&i| i >= meta.files.len()) {
            return false;
        }
        for (index, flag) in self.wanted_files.iter_mut().enumerate() {
            *flag = indices.contains(&index);
        }
        let mask = wanted_pieces(meta, &self.wanted_files);
        if let Some(picker) = self.picker.as_mut() {
            picker.set_wanted(&mask);
        }
        true
    }
}

/// Pieces overlapping at least one wanted file.
fn wanted_pieces(meta: &Metainfo, wanted_files: &[bool]) -> PieceBits {
    let mut mask = PieceBits::new();
    mask.resize(meta.piece_count(), false);
    for (file, &wanted) in meta.files.iter().zip(wanted_files) {
        if !wanted || file.length == 0 {
            continue;
        }
        let first = (file.offset / u64::from(meta.piece_length)) as usize;
        let last = ((file.offset + file.length - 1) / u64::from(meta.piece_length)) as usize;
        for piece in first..=last.min(meta.piece_count().saturating_sub(1)) {
            mask.set(piece, true);
        }
    }
    mask
}

/// Interested peers ranked by rate, best first.
fn rank_for_unchoke(
    peers: impl Iterator<Item = (SocketAddr, u64, bool)>,
) -> Vec<SocketAddr> {
    let mut interested: Vec<(SocketAddr, u64)> = peers
        .filter(|(_, _, interested)| *interested)
        .map(|(addr, rate, _)| (addr, rate))
        .collect();
    interested.sort_by(|a, b| b.1.cmp(&a.1));
    interested.into_iter().map(|(addr, _)| addr).collect()
}

fn pick_random(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    use rand::seq::SliceRandom;
    addrs.choose(&mut rand::thread_rng()).copied()
}

/// Canonical re-encode of the info dictionary, for serving BEP 9.
fn meta_info_blob(meta: &Metainfo) -> Option<Vec<u8>> {
    use super::bencode::Value;
    use std::collections::BTreeMap;

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::from(meta.name.as_str()));
    info.insert(b"piece length".to_vec(), Value::Int(i64::from(meta.piece_length)));
    let mut pieces = Vec::with_capacity(meta.pieces.len() * 20);
    for piece in &meta.pieces {
        pieces.extend_from_slice(piece);
    }
    info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
    if meta.multi_file {
        let files: Vec<Value> = meta
            .files
            .iter()
            .map(|file| {
                let mut entry = BTreeMap::new();
                entry.insert(b"length".to_vec(), Value::Int(file.length as i64));
                let components: Vec<Value> = file
                    .path
                    .components()
                    .map(|c| Value::from(c.as_os_str().to_string_lossy().as_ref()))
                    .collect();
                entry.insert(b"path".to_vec(), Value::List(components));
                Value::Dict(entry)
            })
            .collect();
        info.insert(b"files".to_vec(), Value::List(files));
    } else {
        info.insert(b"length".to_vec(), Value::Int(meta.total_size as i64));
    }
    Some(Value::Dict(info).encode())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    #[test]
    fn test_rank_for_unchoke_orders_interested_by_rate() {
        let ranked = rank_for_unchoke(
            vec![
                (addr(1), 100, true),
                (addr(2), 500, true),
                (addr(3), 900, false), // not interested: excluded
                (addr(4), 300, true),
                (addr(5), 50, true),
            ]
            .into_iter(),
        );
        assert_eq!(&ranked[..3], &[addr(2), addr(4), addr(1)]);
        assert!(!ranked.contains(&addr(3)));
    }

    #[test]
    fn test_assembly_block_bookkeeping() {
        let mut assembly = Assembly::new(0, BLOCK_LEN * 2 + 100);
        assert_eq!(assembly.received.len(), 3);
        assert_eq!(assembly.block_len(0), BLOCK_LEN);
        assert_eq!(assembly.block_len(2), 100);

        // Normal mode: a block requested once is not offered again.
        let first = assembly.next_block(addr(1), false).unwrap();
        assert_eq!(first, 0);
        assembly.requested_from[0].push(addr(1));
        assert_eq!(assembly.next_block(addr(1), false), Some(1));

        // Endgame: the same block may go to a different peer.
        assert_eq!(assembly.next_block(addr(2), true), Some(0));

        assembly.received[0] = true;
        assembly.received[1] = true;
        assembly.received[2] = true;
        assert!(assembly.is_complete());
    }

    #[test]
    fn test_wanted_pieces_covers_selected_files_only() {
        use crate::torrent::bencode::Value;
        use std::collections::BTreeMap;

        // Three files over 16 KiB pieces: f0 = 1 piece, f1 spans 2, f2 tail.
        let mk_file = |len: i64, name: &str| {
            let mut f = BTreeMap::new();
            f.insert(b"length".to_vec(), Value::Int(len));
            f.insert(b"path".to_vec(), Value::List(vec![Value::from(name)]));
            Value::Dict(f)
        };
        let mut info = BTreeMap::new();
        info.insert(
            b"files".to_vec(),
            Value::List(vec![
                mk_file(16_384, "a"),
                mk_file(20_000, "b"),
                mk_file(5_000, "c"),
            ]),
        );
        info.insert(b"name".to_vec(), Value::from("set"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        let total = 16_384 + 20_000 + 5_000;
        let count = (total as usize).div_ceil(16_384);
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; count * 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        let meta = Metainfo::from_bytes(&Value::Dict(root).encode()).unwrap();

        // Only file b wanted: pieces 1 and 2 (bytes 16384..36384).
        let mask = wanted_pieces(&meta, &[false, true, false]);
        assert!(!mask[0]);
        assert!(mask[1]);
        assert!(mask[2]);

        // Only file a wanted: just piece 0.
        let mask = wanted_pieces(&meta, &[true, false, false]);
        assert!(mask[0]);
        assert!(!mask[1]);
    }

    #[test]
    fn test_meta_info_blob_round_trips_info_hash() {
        use crate::torrent::bencode::Value;
        use std::collections::BTreeMap;

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(1000));
        info.insert(b"name".to_vec(), Value::from("x.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![3u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        let blob = Value::Dict(root).encode();

        let meta = Metainfo::from_bytes(&blob).unwrap();
        let served = meta_info_blob(&meta).unwrap();
        assert_eq!(info_hash(&served), meta.info_hash);
    }
}
