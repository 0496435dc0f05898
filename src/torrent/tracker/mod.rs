//! Tracker announce/scrape clients (HTTP and UDP) with BEP 12 tier order.

mod http;
mod udp;

pub use http::HttpTracker;
pub use udp::UdpTracker;

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Tracker failures. All of them are local to the announce attempt: a
/// failing tracker never fails the download.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("network error talking to {url}: {message}")]
    Network { url: String, message: String },

    #[error("tracker {url} timed out")]
    Timeout { url: String },

    #[error("malformed response from {url}: {message}")]
    Protocol { url: String, message: String },

    #[error("tracker {url} reported failure: {reason}")]
    Failure { url: String, reason: String },

    #[error("unsupported tracker scheme in {0}")]
    UnsupportedScheme(String),
}

/// Announce lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// HTTP query value; `None` is omitted entirely.
    #[must_use]
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Started => Some("started"),
            Self::Stopped => Some("stopped"),
            Self::Completed => Some("completed"),
        }
    }

    /// BEP 15 numeric encoding.
    #[must_use]
    pub fn udp_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// One announce call's parameters.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// A successful announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next regular announce.
    pub interval: Duration,
    /// Optional lower bound the tracker insists on.
    pub min_interval: Option<Duration>,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
}

/// Swarm totals from a scrape.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeResponse {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

/// A single tracker endpoint, dispatching on URL scheme.
#[derive(Debug)]
pub enum TrackerClient {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl TrackerClient {
    /// Builds a client for an announce URL.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::UnsupportedScheme`] for anything that is not
    /// `http(s)://` or `udp://`.
    pub fn for_url(url: &str, http: reqwest::Client) -> Result<Self, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(HttpTracker::new(url.to_string(), http)))
        } else if url.starts_with("udp://") {
            Ok(Self::Udp(UdpTracker::new(url.to_string())?))
        } else {
            Err(TrackerError::UnsupportedScheme(url.to_string()))
        }
    }

    /// The announce URL.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Http(t) => t.url(),
            Self::Udp(t) => t.url(),
        }
    }

    /// Performs one announce.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] on transport, protocol, or tracker failure.
    pub async fn announce(&mut self, req: &Announce) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Self::Http(t) => t.announce(req).await,
            Self::Udp(t) => t.announce(req).await,
        }
    }

    /// Performs one scrape.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] on transport, protocol, or tracker failure.
    pub async fn scrape(&mut self, info_hash: [u8; 20]) -> Result<ScrapeResponse, TrackerError> {
        match self {
            Self::Http(t) => t.scrape(info_hash).await,
            Self::Udp(t) => t.scrape(info_hash).await,
        }
    }
}

/// Announce-list tiers in BEP 12 order.
///
/// Tiers are tried top to bottom; trackers within a tier are tried in
/// order and a responding tracker is promoted to the front of its tier so
/// it is preferred next time.
#[derive(Debug)]
pub struct TrackerList {
    tiers: Vec<Vec<TrackerClient>>,
}

impl TrackerList {
    /// Builds the tier list, skipping URLs with unsupported schemes.
    #[must_use]
    pub fn new(tier_urls: &[Vec<String>], http: &reqwest::Client) -> Self {
        let tiers: Vec<Vec<TrackerClient>> = tier_urls
            .iter()
            .map(|tier| {
                tier.iter()
                    .filter_map(|url| match TrackerClient::for_url(url, http.clone()) {
                        Ok(client) => Some(client),
                        Err(e) => {
                            warn!(url, error = %e, "skipping tracker");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<TrackerClient>| !tier.is_empty())
            .collect();
        Self { tiers }
    }

    /// True when no usable tracker remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// All announce URLs, flattened in tier order.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|t| t.url().to_string()))
            .collect()
    }

    /// Appends a tier of extra trackers (from magnet `tr` or user lists).
    pub fn add_tier(&mut self, urls: &[String], http: &reqwest::Client) {
        let tier: Vec<TrackerClient> = urls
            .iter()
            .filter(|url| !self.urls().iter().any(|existing| existing == *url))
            .filter_map(|url| TrackerClient::for_url(url, http.clone()).ok())
            .collect();
        if !tier.is_empty() {
            self.tiers.push(tier);
        }
    }

    /// Announces in tier order until one tracker responds.
    ///
    /// # Errors
    ///
    /// Returns the last error once every tracker has failed.
    pub async fn announce(&mut self, req: &Announce) -> Result<AnnounceResponse, TrackerError> {
        let mut last_err = None;
        for tier in &mut self.tiers {
            for index in 0..tier.len() {
                match tier[index].announce(req).await {
                    Ok(response) => {
                        debug!(
                            url = tier[index].url(),
                            peers = response.peers.len(),
                            "announce ok"
                        );
                        // BEP 12: the responding tracker moves to the front
                        // of its tier.
                        tier[..=index].rotate_right(1);
                        return Ok(response);
                    }
                    Err(e) => {
                        debug!(error = %e, "announce failed, trying next tracker");
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TrackerError::UnsupportedScheme("<empty list>".into())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encodings() {
        assert_eq!(AnnounceEvent::None.query_value(), None);
        assert_eq!(AnnounceEvent::Started.query_value(), Some("started"));
        assert_eq!(AnnounceEvent::None.udp_value(), 0);
        assert_eq!(AnnounceEvent::Completed.udp_value(), 1);
        assert_eq!(AnnounceEvent::Started.udp_value(), 2);
        assert_eq!(AnnounceEvent::Stopped.udp_value(), 3);
    }

    #[test]
    fn test_for_url_dispatch() {
        let http = reqwest::Client::new();
        assert!(matches!(
            TrackerClient::for_url("http://t.example/announce", http.clone()),
            Ok(TrackerClient::Http(_))
        ));
        assert!(matches!(
            TrackerClient::for_url("udp://t.example:6969/announce", http.clone()),
            Ok(TrackerClient::Udp(_))
        ));
        assert!(matches!(
            TrackerClient::for_url("wss://t.example", http),
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_tracker_list_skips_unsupported_and_dedupes() {
        let http = reqwest::Client::new();
        let mut list = TrackerList::new(
            &[
                vec!["http://a/ann".into(), "wss://bad".into()],
                vec!["udp://b:6969/ann".into()],
            ],
            &http,
        );
        assert_eq!(list.urls(), vec!["http://a/ann", "udp://b:6969/ann"]);

        list.add_tier(&["http://a/ann".into(), "http://c/ann".into()], &http);
        assert_eq!(
            list.urls(),
            vec!["http://a/ann", "udp://b:6969/ann", "http://c/ann"]
        );
    }
}
