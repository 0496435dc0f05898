//! Two in-process torrent sessions exchanging a file over localhost:
//! handshake, bitfield, interest, choking, block transfer, verification.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fetchd_core::config::TorrentConfig;
use fetchd_core::limiter::LimiterRegistry;
use fetchd_core::record::DownloadId;
use fetchd_core::torrent::MagnetLink;
use fetchd_core::torrent::bencode::Value;
use fetchd_core::torrent::metainfo::{Metainfo, info_hash};
use fetchd_core::torrent::session::{SwarmServices, TorrentInput, TorrentParams};
use fetchd_core::torrent::{generate_peer_id, listener, session};
use fetchd_core::worker::{WorkerContext, WorkerUpdate};
use tokio::sync::{mpsc, watch};

const PIECE_LEN: usize = 16_384;

/// Builds a real single-file torrent over `content` with valid hashes.
fn build_torrent(name: &str, content: &[u8]) -> (Vec<u8>, Metainfo) {
    let mut pieces = Vec::new();
    for chunk in content.chunks(PIECE_LEN) {
        pieces.extend_from_slice(&info_hash(chunk)); // plain SHA-1
    }
    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
    info.insert(b"name".to_vec(), Value::from(name));
    info.insert(b"piece length".to_vec(), Value::Int(PIECE_LEN as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
    let mut root = BTreeMap::new();
    root.insert(b"info".to_vec(), Value::Dict(info));
    let blob = Value::Dict(root).encode();
    let meta = Metainfo::from_bytes(&blob).unwrap();
    (blob, meta)
}

async fn make_services(port_low: u16, seed_ratio: f64) -> Arc<SwarmServices> {
    let peer_listener = listener::spawn((port_low, port_low + 9)).await.unwrap();
    let mut config = TorrentConfig::default();
    config.dht_bootstrap_nodes = Vec::new();
    config.peer_timeout = 60;
    Arc::new(SwarmServices {
        config,
        max_peers: 10,
        seed_ratio,
        peer_id: generate_peer_id(),
        listen_port: peer_listener.port,
        registry: peer_listener.registry,
        http: reqwest::Client::new(),
        dht: None,
        lpd: None,
        limiters: Arc::new(LimiterRegistry::new(0, 0)),
    })
}

struct RunningSession {
    id: DownloadId,
    updates: mpsc::Receiver<WorkerUpdate>,
    cancel: watch::Sender<bool>,
    _query_tx: mpsc::Sender<session::SessionQuery>,
}

fn spawn_session(
    input: TorrentInput,
    save_dir: &Path,
    services: Arc<SwarmServices>,
    resume_have: Option<Vec<u8>>,
) -> RunningSession {
    let id = DownloadId::generate();
    let (update_tx, updates) = mpsc::channel(256);
    let (cancel, cancel_rx) = watch::channel(false);
    let (query_tx, query_rx) = mpsc::channel(4);
    let ctx = WorkerContext::new(id.clone(), update_tx, cancel_rx);
    let params = TorrentParams {
        input,
        save_dir: save_dir.to_path_buf(),
        sequential: false,
        resume_have,
        extra_trackers: Vec::new(),
    };
    tokio::spawn(session::run(params, services, ctx, query_rx));
    RunningSession { id, updates, cancel, _query_tx: query_tx }
}

/// Full-bitfield seeder over `content`, serving from `dir`.
async fn spawn_seeder(
    meta: &Metainfo,
    content: &[u8],
    dir: &Path,
    port_low: u16,
) -> (RunningSession, Arc<SwarmServices>) {
    std::fs::write(dir.join(&meta.name), content).unwrap();
    let services = make_services(port_low, f64::INFINITY).await;
    let piece_count = meta.piece_count();
    let mut have = vec![0u8; piece_count.div_ceil(8)];
    for piece in 0..piece_count {
        have[piece / 8] |= 0x80 >> (piece % 8);
    }
    let session = spawn_session(
        TorrentInput::Metainfo(Box::new(meta.clone())),
        dir,
        Arc::clone(&services),
        Some(have),
    );
    (session, services)
}

/// Feeds `addr` into a session's discovery channel once it registers.
async fn inject_peer(services: &SwarmServices, info_hash: [u8; 20], addr: std::net::SocketAddr) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(hooks) = services.registry.get(&info_hash).map(|h| h.clone()) {
            hooks.discovered.send(addr).await.unwrap();
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "session never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Drains updates until the session finishes, returning its outcome.
async fn wait_finished(
    session: &mut RunningSession,
    timeout: Duration,
) -> Result<(), fetchd_core::EngineError> {
    tokio::time::timeout(timeout, async {
        loop {
            match session.updates.recv().await {
                Some(WorkerUpdate::Finished { result, .. }) => break result,
                Some(_) => {}
                None => panic!("update channel closed before Finished"),
            }
        }
    })
    .await
    .expect("session did not finish in time")
}

#[tokio::test]
async fn leecher_downloads_from_seeder_over_localhost() {
    // ~2.5 pieces of deterministic content.
    let content: Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
    let (_blob, meta) = build_torrent("swarm.bin", &content);

    let seed_dir = tempfile::tempdir().unwrap();
    let (mut seeder, seeder_services) =
        spawn_seeder(&meta, &content, seed_dir.path(), 42100).await;

    // Leecher: empty dir, ratio 0 so it finishes right after download.
    let leech_dir = tempfile::tempdir().unwrap();
    let leecher_services = make_services(42120, 0.0).await;
    let mut leecher = spawn_session(
        TorrentInput::Metainfo(Box::new(meta.clone())),
        leech_dir.path(),
        Arc::clone(&leecher_services),
        None,
    );

    // Hand the seeder's address to the leecher through its discovery
    // channel (the path LPD/PEX peers arrive on).
    let seeder_addr = format!("127.0.0.1:{}", seeder_services.listen_port).parse().unwrap();
    inject_peer(&leecher_services, meta.info_hash, seeder_addr).await;

    // The first choke review on the seeder side gates the start of
    // transfer, so allow generous time.
    wait_finished(&mut leecher, Duration::from_secs(60)).await.expect("leecher failed");

    let downloaded = std::fs::read(leech_dir.path().join("swarm.bin")).unwrap();
    assert_eq!(downloaded, content);

    // Quiet shutdown for both sessions.
    let _ = seeder.cancel.send(true);
    let _ = leecher.cancel.send(true);
    while let Ok(update) = seeder.updates.try_recv() {
        if let WorkerUpdate::Finished { result, .. } = update {
            result.expect("seeder errored");
        }
    }
}

#[tokio::test]
async fn magnet_acquires_metadata_then_downloads() {
    let content: Vec<u8> = (0..30_000u32).map(|i| (i % 199) as u8).collect();
    let (_blob, meta) = build_torrent("magnetized.bin", &content);

    let seed_dir = tempfile::tempdir().unwrap();
    let (seeder, seeder_services) = spawn_seeder(&meta, &content, seed_dir.path(), 42140).await;

    // The leecher starts from a bare magnet link: no metadata, no size.
    let leech_dir = tempfile::tempdir().unwrap();
    let leecher_services = make_services(42160, 0.0).await;
    let magnet = MagnetLink {
        info_hash: meta.info_hash,
        display_name: Some("magnetized.bin".into()),
        trackers: Vec::new(),
        web_seeds: Vec::new(),
        exact_length: None,
    };
    let mut leecher = spawn_session(
        TorrentInput::Magnet(magnet),
        leech_dir.path(),
        Arc::clone(&leecher_services),
        None,
    );

    let seeder_addr = format!("127.0.0.1:{}", seeder_services.listen_port).parse().unwrap();
    inject_peer(&leecher_services, meta.info_hash, seeder_addr).await;

    // Watch for the size to resolve via BEP 9 before completion.
    let mut saw_resolved_total = false;
    let finished = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match leecher.updates.recv().await {
                Some(WorkerUpdate::Resolved { info, .. }) => {
                    if info.total == Some(content.len() as u64) {
                        saw_resolved_total = true;
                    }
                }
                Some(WorkerUpdate::Finished { result, .. }) => break result,
                Some(_) => {}
                None => panic!("update channel closed before Finished"),
            }
        }
    })
    .await
    .expect("magnet download did not finish in time");
    finished.expect("magnet leecher failed");
    assert!(saw_resolved_total, "total never resolved from swarm metadata");

    let downloaded = std::fs::read(leech_dir.path().join("magnetized.bin")).unwrap();
    assert_eq!(downloaded, content);

    let _ = seeder.cancel.send(true);
    let _ = leecher.cancel.send(true);
}
