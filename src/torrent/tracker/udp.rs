//! UDP tracker client (BEP 15).
//!
//! Two round trips: a connect request yields a 64-bit connection id valid
//! for 60 seconds, then announces/scrapes reuse it. Responses correlate by
//! transaction id; lost packets are retransmitted on the 15 × 2ⁿ schedule.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Announce, AnnounceResponse, ScrapeResponse, TrackerError};
use crate::torrent::peer::parse_compact_peers;

/// BEP 15 connect-request magic.
const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// A connection id may be used until one minute after receipt.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Retransmission attempts. The schedule is 15 × 2ⁿ seconds; BEP 15 runs
/// n up to 8 (3840 s), far beyond a usable announce budget, so we stop
/// early and let the regular announce interval try again.
const MAX_RETRANSMITS: u32 = 3;

#[derive(Debug)]
pub struct UdpTracker {
    url: String,
    /// `host:port` resolved from the URL authority.
    authority: String,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    /// Parses the `udp://host:port/...` announce URL.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UnsupportedScheme`] when no authority can
    /// be extracted.
    pub fn new(url: String) -> Result<Self, TrackerError> {
        let parsed = url::Url::parse(&url)
            .map_err(|_| TrackerError::UnsupportedScheme(url.clone()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TrackerError::UnsupportedScheme(url.clone()))?;
        let port = parsed
            .port()
            .ok_or_else(|| TrackerError::UnsupportedScheme(url.clone()))?;
        Ok(Self {
            authority: format!("{host}:{port}"),
            url,
            connection: None,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// One announce, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] on timeout, transport, or protocol errors.
    pub async fn announce(&mut self, req: &Announce) -> Result<AnnounceResponse, TrackerError> {
        let socket = self.bind().await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: u32 = rand::thread_rng().r#gen();
        let key: u32 = rand::thread_rng().r#gen();
        let mut packet = BytesMut::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(transaction_id);
        packet.put_slice(&req.info_hash);
        packet.put_slice(&req.peer_id);
        packet.put_u64(req.downloaded);
        packet.put_u64(req.left);
        packet.put_u64(req.uploaded);
        packet.put_u32(req.event.udp_value());
        packet.put_u32(0); // IP address: default
        packet.put_u32(key);
        packet.put_i32(-1); // num_want: default
        packet.put_u16(req.port);

        let mut response = self.exchange(&socket, &packet, transaction_id).await?;
        if response.len() < 20 {
            return Err(self.protocol("short announce response"));
        }
        response.advance(8); // action + transaction id, already checked
        let interval = response.get_u32();
        let leechers = response.get_u32();
        let seeders = response.get_u32();
        let peers = parse_compact_peers(&response);

        Ok(AnnounceResponse {
            interval: Duration::from_secs(u64::from(interval.max(1))),
            min_interval: None,
            seeders,
            leechers,
            peers,
        })
    }

    /// One scrape for a single info hash.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] on timeout, transport, or protocol errors.
    pub async fn scrape(&mut self, info_hash: [u8; 20]) -> Result<ScrapeResponse, TrackerError> {
        let socket = self.bind().await?;
        let connection_id = self.connection_id(&socket).await?;

        let transaction_id: u32 = rand::thread_rng().r#gen();
        let mut packet = BytesMut::with_capacity(36);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_SCRAPE);
        packet.put_u32(transaction_id);
        packet.put_slice(&info_hash);

        let mut response = self.exchange(&socket, &packet, transaction_id).await?;
        if response.len() < 20 {
            return Err(self.protocol("short scrape response"));
        }
        response.advance(8);
        Ok(ScrapeResponse {
            seeders: response.get_u32(),
            completed: response.get_u32(),
            leechers: response.get_u32(),
        })
    }

    async fn bind(&self) -> Result<UdpSocket, TrackerError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| TrackerError::Network {
            url: self.url.clone(),
            message: e.to_string(),
        })?;
        socket
            .connect(&self.authority)
            .await
            .map_err(|e| TrackerError::Network { url: self.url.clone(), message: e.to_string() })?;
        Ok(socket)
    }

    /// Returns a cached connection id or performs the connect round trip.
    async fn connection_id(&mut self, socket: &UdpSocket) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = self.connection
            && obtained.elapsed() < CONNECTION_ID_TTL
        {
            trace!(url = %self.url, "reusing connection id");
            return Ok(id);
        }

        let transaction_id: u32 = rand::thread_rng().r#gen();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_MAGIC);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);

        let mut response = self.exchange(socket, &packet, transaction_id).await?;
        if response.len() < 16 {
            return Err(self.protocol("short connect response"));
        }
        response.advance(8);
        let connection_id = response.get_u64();
        self.connection = Some((connection_id, Instant::now()));
        debug!(url = %self.url, "udp tracker connected");
        Ok(connection_id)
    }

    /// Sends a packet and waits for the matching response, retransmitting
    /// on the BEP 15 schedule.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        transaction_id: u32,
    ) -> Result<BytesMut, TrackerError> {
        let mut buf = vec![0u8; 4096];
        for attempt in 0..=MAX_RETRANSMITS {
            socket.send(packet).await.map_err(|e| TrackerError::Network {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

            let timeout = Duration::from_secs(15 * (1u64 << attempt));
            match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= 8 => {
                    let mut response = BytesMut::from(&buf[..n]);
                    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
                    let tid = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
                    if tid != transaction_id {
                        // Stale datagram from an earlier attempt; wait for ours.
                        continue;
                    }
                    if action == ACTION_ERROR {
                        response.advance(8);
                        let reason = String::from_utf8_lossy(&response).into_owned();
                        return Err(TrackerError::Failure { url: self.url.clone(), reason });
                    }
                    return Ok(response);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    return Err(TrackerError::Network {
                        url: self.url.clone(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    trace!(url = %self.url, attempt, "udp tracker timeout, retransmitting");
                }
            }
        }
        Err(TrackerError::Timeout { url: self.url.clone() })
    }

    fn protocol(&self, message: &str) -> TrackerError {
        TrackerError::Protocol { url: self.url.clone(), message: message.to_string() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::torrent::tracker::AnnounceEvent;

    #[test]
    fn test_url_parsing() {
        let tracker = UdpTracker::new("udp://tracker.example:6969/announce".into()).unwrap();
        assert_eq!(tracker.authority, "tracker.example:6969");
        assert!(UdpTracker::new("udp://noport.example/announce".into()).is_err());
    }

    /// Minimal in-process BEP 15 tracker for the tests below.
    async fn mock_tracker(peers: Vec<[u8; 6]>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let connection_id: u64 = 0xdead_beef_cafe;
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
                if n < 16 {
                    continue;
                }
                let mut packet = BytesMut::from(&buf[..n]);
                let first = packet.get_u64();
                let action = packet.get_u32();
                let tid = packet.get_u32();
                let mut reply = BytesMut::new();
                if action == ACTION_CONNECT && first == PROTOCOL_MAGIC {
                    reply.put_u32(ACTION_CONNECT);
                    reply.put_u32(tid);
                    reply.put_u64(connection_id);
                } else if action == ACTION_ANNOUNCE && first == connection_id {
                    reply.put_u32(ACTION_ANNOUNCE);
                    reply.put_u32(tid);
                    reply.put_u32(1800); // interval
                    reply.put_u32(3); // leechers
                    reply.put_u32(7); // seeders
                    for peer in &peers {
                        reply.put_slice(peer);
                    }
                } else {
                    continue;
                }
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_then_announce() {
        let addr = mock_tracker(vec![[127, 0, 0, 1, 0x1a, 0xe1]]).await;
        let mut tracker = UdpTracker::new(format!("udp://{addr}/announce")).unwrap();
        let response = tracker
            .announce(&Announce {
                info_hash: [1; 20],
                peer_id: *b"-FD0100-000000000002",
                port: 6882,
                uploaded: 0,
                downloaded: 0,
                left: 1000,
                event: AnnounceEvent::Started,
            })
            .await
            .unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.seeders, 7);
        assert_eq!(response.leechers, 3);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        // The connection id is cached for reuse.
        assert!(tracker.connection.is_some());
    }
}
