//! HTTP(S) tracker client.
//!
//! Announce is a GET with percent-encoded binary `info_hash`/`peer_id`
//! query parameters and a bencoded response; peers arrive either as a
//! compact 6-byte-per-peer string or as a list of `{ip, port}` dicts.

use std::net::SocketAddr;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};

use super::{Announce, AnnounceResponse, ScrapeResponse, TrackerError};
use crate::torrent::bencode::Value;
use crate::torrent::peer::parse_compact_peers;

/// Trackers that do not answer within this budget are retried at the next
/// announce interval.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How many peers we ask for per announce.
const NUM_WANT: u32 = 50;

#[derive(Debug)]
pub struct HttpTracker {
    url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    #[must_use]
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// One announce round trip.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] on transport failure, a bencode failure
    /// reason, or a malformed response.
    pub async fn announce(&mut self, req: &Announce) -> Result<AnnounceResponse, TrackerError> {
        let query_url = self.announce_url(req);
        let body = self.fetch(&query_url).await?;
        let root = Value::decode(&body).map_err(|e| TrackerError::Protocol {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        if let Some(reason) = root.get_str(b"failure reason") {
            return Err(TrackerError::Failure {
                url: self.url.clone(),
                reason: reason.to_string(),
            });
        }

        let interval = root
            .get_int(b"interval")
            .filter(|&i| i > 0)
            .map(|i| Duration::from_secs(i as u64))
            .ok_or_else(|| TrackerError::Protocol {
                url: self.url.clone(),
                message: "missing interval".into(),
            })?;
        let min_interval = root
            .get_int(b"min interval")
            .filter(|&i| i > 0)
            .map(|i| Duration::from_secs(i as u64));

        let peers = match root.get(b"peers") {
            Some(Value::Bytes(compact)) => parse_compact_peers(compact),
            Some(Value::List(dicts)) => parse_peer_dicts(dicts),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval,
            seeders: root.get_int(b"complete").and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
            leechers: root.get_int(b"incomplete").and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
            peers,
        })
    }

    /// One scrape round trip against the conventional `/scrape` path.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`]; trackers without a scrape endpoint fail
    /// with a protocol error.
    pub async fn scrape(&mut self, info_hash: [u8; 20]) -> Result<ScrapeResponse, TrackerError> {
        let scrape_url = self
            .url
            .replace("/announce", "/scrape");
        let sep = if scrape_url.contains('?') { '&' } else { '?' };
        let query_url = format!(
            "{scrape_url}{sep}info_hash={}",
            percent_encode(&info_hash, NON_ALPHANUMERIC)
        );
        let body = self.fetch(&query_url).await?;
        let root = Value::decode(&body).map_err(|e| TrackerError::Protocol {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        let files = root.get(b"files").and_then(Value::as_dict).ok_or_else(|| {
            TrackerError::Protocol { url: self.url.clone(), message: "missing files".into() }
        })?;
        let stats = files
            .get(info_hash.as_slice())
            .ok_or_else(|| TrackerError::Protocol {
                url: self.url.clone(),
                message: "info hash absent from scrape".into(),
            })?;

        Ok(ScrapeResponse {
            seeders: stats.get_int(b"complete").and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
            completed: stats.get_int(b"downloaded").and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
            leechers: stats.get_int(b"incomplete").and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
        })
    }

    fn announce_url(&self, req: &Announce) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{base}{sep}info_hash={ih}&peer_id={pid}&port={port}&uploaded={up}\
             &downloaded={down}&left={left}&compact=1&numwant={want}",
            base = self.url,
            ih = percent_encode(&req.info_hash, NON_ALPHANUMERIC),
            pid = percent_encode(&req.peer_id, NON_ALPHANUMERIC),
            port = req.port,
            up = req.uploaded,
            down = req.downloaded,
            left = req.left,
            want = NUM_WANT,
        );
        if let Some(event) = req.event.query_value() {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    async fn fetch(&self, query_url: &str) -> Result<Vec<u8>, TrackerError> {
        let response = self
            .client
            .get(query_url)
            .timeout(ANNOUNCE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TrackerError::Timeout { url: self.url.clone() }
                } else {
                    TrackerError::Network { url: self.url.clone(), message: e.to_string() }
                }
            })?;
        if !response.status().is_success() {
            return Err(TrackerError::Network {
                url: self.url.clone(),
                message: format!("HTTP {}", response.status().as_u16()),
            });
        }
        let bytes = response.bytes().await.map_err(|e| TrackerError::Network {
            url: self.url.clone(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

fn parse_peer_dicts(dicts: &[Value]) -> Vec<SocketAddr> {
    dicts
        .iter()
        .filter_map(|peer| {
            let ip: std::net::IpAddr = peer.get_str(b"ip")?.parse().ok()?;
            let port = peer.get_int(b"port").and_then(|p| u16::try_from(p).ok())?;
            (port != 0).then_some(SocketAddr::from((ip, port)))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::torrent::tracker::AnnounceEvent;
    use std::collections::BTreeMap;

    fn sample_announce() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"-FD0100-000000000001",
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: AnnounceEvent::Started,
        }
    }

    #[test]
    fn test_announce_url_shape() {
        let tracker = HttpTracker::new("http://t.example/announce".into(), reqwest::Client::new());
        let url = tracker.announce_url(&sample_announce());
        assert!(url.starts_with("http://t.example/announce?info_hash=%AB%AB"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&uploaded=10"));
        assert!(url.contains("&downloaded=20"));
        assert!(url.contains("&left=30"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&event=started"));
    }

    #[test]
    fn test_announce_url_appends_to_existing_query() {
        let tracker = HttpTracker::new(
            "http://t.example/announce?key=abc".into(),
            reqwest::Client::new(),
        );
        let url = tracker.announce_url(&sample_announce());
        assert!(url.starts_with("http://t.example/announce?key=abc&info_hash="));
    }

    #[test]
    fn test_omitted_event_for_regular_announce() {
        let tracker = HttpTracker::new("http://t/announce".into(), reqwest::Client::new());
        let mut req = sample_announce();
        req.event = AnnounceEvent::None;
        assert!(!tracker.announce_url(&req).contains("event="));
    }

    #[test]
    fn test_parse_peer_dicts() {
        let mut p1 = BTreeMap::new();
        p1.insert(b"ip".to_vec(), Value::from("10.1.2.3"));
        p1.insert(b"port".to_vec(), Value::Int(6881));
        let mut p2 = BTreeMap::new();
        p2.insert(b"ip".to_vec(), Value::from("not-an-ip"));
        p2.insert(b"port".to_vec(), Value::Int(1));
        let peers = parse_peer_dicts(&[Value::Dict(p1), Value::Dict(p2)]);
        assert_eq!(peers, vec!["10.1.2.3:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_against_mock_tracker() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // interval 1800, complete 5, incomplete 3, one compact peer.
        let mut body = b"d8:completei5e10:incompletei3e8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        Mock::given(method("GET"))
            .and(path("/announce"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let mut tracker =
            HttpTracker::new(format!("{}/announce", server.uri()), reqwest::Client::new());
        let response = tracker.announce(&sample_announce()).await.unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.seeders, 5);
        assert_eq!(response.leechers, 3);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_announce_surfaces_failure_reason() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"d14:failure reason14:torrent absente".to_vec()),
            )
            .mount(&server)
            .await;

        let mut tracker =
            HttpTracker::new(format!("{}/announce", server.uri()), reqwest::Client::new());
        match tracker.announce(&sample_announce()).await {
            Err(TrackerError::Failure { reason, .. }) => assert_eq!(reason, "torrent absent"),
            other => panic!("expected failure reason, got {other:?}"),
        }
    }
}
