//! Local Peer Discovery (BEP 14).
//!
//! Plain-text `BT-SEARCH` datagrams on the `239.192.152.143:6771`
//! multicast group. The engine runs one listener shared by all torrents;
//! each active torrent announces itself every five minutes. A random
//! per-session cookie lets us drop our own multicasts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// The BEP 14 multicast group.
pub const LPD_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);

/// The BEP 14 multicast port.
pub const LPD_PORT: u16 = 6771;

/// Interval between announcements per torrent.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);

/// A locally discovered peer for an info hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpdPeer {
    pub info_hash_hex: String,
    pub addr: SocketAddr,
}

/// Handle for registering torrents with the LPD task.
#[derive(Debug, Clone)]
pub struct LpdHandle {
    tx: mpsc::Sender<LpdCommand>,
}

#[derive(Debug)]
enum LpdCommand {
    /// Start announcing an info hash (lowercase hex) on our listen port.
    Register { info_hash_hex: String },
    Unregister { info_hash_hex: String },
}

impl LpdHandle {
    pub async fn register(&self, info_hash_hex: String) {
        let _ = self.tx.send(LpdCommand::Register { info_hash_hex }).await;
    }

    pub async fn unregister(&self, info_hash_hex: String) {
        let _ = self.tx.send(LpdCommand::Unregister { info_hash_hex }).await;
    }
}

/// Spawns the shared LPD task. Discovered peers arrive on `peer_tx`.
/// Returns `None` when the multicast socket cannot be joined.
pub async fn spawn(listen_port: u16, peer_tx: mpsc::Sender<LpdPeer>) -> Option<LpdHandle> {
    let socket = match bind_multicast() {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "LPD unavailable, continuing without it");
            return None;
        }
    };
    let (tx, rx) = mpsc::channel(16);
    let cookie: u32 = rand::thread_rng().r#gen();
    tokio::spawn(run(socket, listen_port, format!("{cookie:08x}"), peer_tx, rx));
    Some(LpdHandle { tx })
}

fn bind_multicast() -> std::io::Result<UdpSocket> {
    let std_socket = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LPD_PORT))?;
    std_socket.join_multicast_v4(&LPD_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

async fn run(
    socket: UdpSocket,
    listen_port: u16,
    cookie: String,
    peer_tx: mpsc::Sender<LpdPeer>,
    mut rx: mpsc::Receiver<LpdCommand>,
) {
    let mut registered: Vec<String> = Vec::new();
    let mut announce = tokio::time::interval(ANNOUNCE_INTERVAL);
    announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buf = vec![0u8; 1500];
    let group = SocketAddrV4::new(LPD_GROUP, LPD_PORT);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(LpdCommand::Register { info_hash_hex }) => {
                        if !registered.contains(&info_hash_hex) {
                            // Announce right away so local peers find each
                            // other without waiting a full interval.
                            let datagram = announcement(listen_port, &info_hash_hex, &cookie);
                            let _ = socket.send_to(datagram.as_bytes(), group).await;
                            registered.push(info_hash_hex);
                        }
                    }
                    Some(LpdCommand::Unregister { info_hash_hex }) => {
                        registered.retain(|h| h != &info_hash_hex);
                    }
                    None => return,
                }
            }
            incoming = socket.recv_from(&mut buf) => {
                let Ok((n, from)) = incoming else { continue };
                let Some((info_hash_hex, port, their_cookie)) = parse_announcement(&buf[..n]) else {
                    continue;
                };
                if their_cookie.as_deref() == Some(cookie.as_str()) {
                    trace!("ignoring our own LPD announcement");
                    continue;
                }
                let addr = SocketAddr::new(from.ip(), port);
                debug!(%addr, info_hash = %info_hash_hex, "LPD peer discovered");
                let _ = peer_tx.send(LpdPeer { info_hash_hex, addr }).await;
            }
            _ = announce.tick() => {
                for info_hash_hex in &registered {
                    let datagram = announcement(listen_port, info_hash_hex, &cookie);
                    let _ = socket.send_to(datagram.as_bytes(), group).await;
                }
            }
        }
    }
}

/// Formats a BT-SEARCH announcement.
fn announcement(port: u16, info_hash_hex: &str, cookie: &str) -> String {
    format!(
        "BT-SEARCH * HTTP/1.1\r\n\
         Host: {LPD_GROUP}:{LPD_PORT}\r\n\
         Port: {port}\r\n\
         Infohash: {info_hash_hex}\r\n\
         cookie: {cookie}\r\n\
         \r\n\r\n"
    )
}

/// Parses a BT-SEARCH announcement into (info hash, port, cookie).
fn parse_announcement(datagram: &[u8]) -> Option<(String, u16, Option<String>)> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut lines = text.split("\r\n");
    if !lines.next()?.starts_with("BT-SEARCH") {
        return None;
    }

    let mut port = None;
    let mut info_hash = None;
    let mut cookie = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "port" => port = value.parse::<u16>().ok(),
            "infohash" => {
                if value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
                    info_hash = Some(value.to_ascii_lowercase());
                }
            }
            "cookie" => cookie = Some(value.to_string()),
            _ => {}
        }
    }
    let port = port.filter(|&p| p != 0)?;
    Some((info_hash?, port, cookie))
}
