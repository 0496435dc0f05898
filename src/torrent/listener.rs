//! Shared BitTorrent listen socket.
//!
//! The engine binds one TCP listener within the configured port range and
//! routes every accepted connection to the torrent session owning the
//! info hash named in the inbound handshake. Failing to bind any port in
//! the range is fatal to engine startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::peer::codec::{Handshake, PROTOCOL_STRING};
use crate::error::{EngineError, ErrorKind};

/// How long an inbound connection may take to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An accepted peer whose handshake routed to a session.
#[derive(Debug)]
pub struct IncomingPeer {
    pub addr: SocketAddr,
    pub socket: TcpStream,
    pub handshake: Handshake,
}

/// Per-info-hash routing entries for inbound peers and discovered
/// addresses (LPD, PEX relayed at engine level).
#[derive(Debug, Clone)]
pub struct SwarmHooks {
    /// Accepted sockets for this torrent.
    pub incoming: mpsc::Sender<IncomingPeer>,
    /// Bare addresses discovered outside the session (LPD).
    pub discovered: mpsc::Sender<SocketAddr>,
}

/// Info hash → session routing table, shared by listener and discovery.
pub type SwarmRegistry = Arc<DashMap<[u8; 20], SwarmHooks>>;

/// The bound listener plus its routing table.
#[derive(Debug)]
pub struct PeerListener {
    pub port: u16,
    pub registry: SwarmRegistry,
}

/// Binds the first free port in `range` and spawns the accept loop.
///
/// # Errors
///
/// Returns a fatal [`EngineError`] when every port in the range is taken.
pub async fn spawn(range: (u16, u16)) -> Result<PeerListener, EngineError> {
    let (low, high) = range;
    let mut listener = None;
    for port in low..=high {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(bound) => {
                info!(port, "peer listener bound");
                listener = Some((bound, port));
                break;
            }
            Err(e) => debug!(port, error = %e, "listen port unavailable"),
        }
    }
    let Some((listener, port)) = listener else {
        return Err(EngineError::fatal(
            ErrorKind::Network,
            format!("no listen port available in {low}-{high}"),
        ));
    };

    let registry: SwarmRegistry = Arc::new(DashMap::new());
    let accept_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let registry = Arc::clone(&accept_registry);
                    tokio::spawn(route_incoming(socket, addr, registry));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    });

    Ok(PeerListener { port, registry })
}

/// Reads the 68-byte handshake and hands the socket to the owning session.
async fn route_incoming(mut socket: TcpStream, addr: SocketAddr, registry: SwarmRegistry) {
    let mut raw = [0u8; 68];
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.read_exact(&mut raw)).await;
    if !matches!(read, Ok(Ok(_))) {
        trace!(%addr, "inbound connection closed before handshake");
        return;
    }
    if raw[0] != 19 || &raw[1..20] != PROTOCOL_STRING {
        trace!(%addr, "inbound connection is not BitTorrent");
        return;
    }

    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&raw[20..28]);
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&raw[28..48]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&raw[48..68]);
    let handshake = Handshake { reserved, info_hash, peer_id };

    let Some(hooks) = registry.get(&info_hash).map(|h| h.clone()) else {
        trace!(%addr, "no session for inbound info hash");
        return;
    };
    debug!(%addr, "routing inbound peer");
    let _ = hooks.incoming.send(IncomingPeer { addr, socket, handshake }).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_binds_within_range_and_routes_by_info_hash() {
        // High ephemeral-ish range to avoid clashing with anything local.
        let listener = spawn((49160, 49190)).await.unwrap();
        assert!((49160..=49190).contains(&listener.port));

        let info_hash = [0x11u8; 20];
        let (incoming_tx, mut incoming_rx) = mpsc::channel(1);
        let (discovered_tx, _discovered_rx) = mpsc::channel(1);
        listener
            .registry
            .insert(info_hash, SwarmHooks { incoming: incoming_tx, discovered: discovered_tx });

        let mut client = TcpStream::connect(("127.0.0.1", listener.port)).await.unwrap();
        let mut handshake = Vec::with_capacity(68);
        handshake.push(19);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&[0u8; 8]);
        handshake.extend_from_slice(&info_hash);
        handshake.extend_from_slice(b"-XX0001-abcdefghijkl");
        client.write_all(&handshake).await.unwrap();

        let routed = tokio::time::timeout(Duration::from_secs(2), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.handshake.info_hash, info_hash);
        assert_eq!(&routed.handshake.peer_id, b"-XX0001-abcdefghijkl");
    }

    #[tokio::test]
    async fn test_unknown_info_hash_is_dropped() {
        let listener = spawn((49200, 49230)).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", listener.port)).await.unwrap();
        let mut handshake = Vec::with_capacity(68);
        handshake.push(19);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&[0u8; 48]);
        client.write_all(&handshake).await.unwrap();
        // The engine closes the socket; the next read observes EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
