//! Engine configuration.
//!
//! The recognized options are enumerated here with their defaults; the
//! settings table persists the serde form and [`EngineConfig`] round-trips
//! through it. Unknown keys in stored settings are ignored so older
//! databases keep loading.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum number of simultaneously downloading records.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;

/// Default per-download connection cap for segmented HTTP fetches.
pub const DEFAULT_MAX_CONNECTIONS_PER_DOWNLOAD: usize = 16;

/// Default minimum segment size (1 MiB).
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Default swarm size cap per torrent.
pub const DEFAULT_MAX_PEERS: usize = 55;

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory new downloads save into unless overridden per call.
    pub download_dir: PathBuf,
    /// Cap on records in the `downloading` state.
    pub max_concurrent_downloads: usize,
    /// Cap on parallel segment connections per HTTP download.
    pub max_connections_per_download: usize,
    /// Segments are never planned smaller than this.
    pub min_segment_size: u64,
    /// Bytes per second across all downloads; 0 = unlimited.
    pub global_download_limit: u64,
    /// Bytes per second across all uploads; 0 = unlimited.
    pub global_upload_limit: u64,
    /// User-Agent sent with HTTP requests and tracker announces.
    pub user_agent: String,
    pub enable_dht: bool,
    pub enable_pex: bool,
    pub enable_lpd: bool,
    /// Connection cap per torrent swarm.
    pub max_peers: usize,
    /// Seeding stops once uploaded/downloaded reaches this ratio.
    pub seed_ratio: f64,
    /// Engine database location; defaults next to the download dir.
    pub database_path: Option<PathBuf>,
    /// Reject unknown fields in RPC params instead of ignoring them.
    pub rpc_strict_params: bool,
    pub http: HttpConfig,
    pub torrent: TorrentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_connections_per_download: DEFAULT_MAX_CONNECTIONS_PER_DOWNLOAD,
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            global_download_limit: 0,
            global_upload_limit: 0,
            user_agent: default_user_agent(),
            enable_dht: true,
            enable_pex: true,
            enable_lpd: true,
            max_peers: DEFAULT_MAX_PEERS,
            seed_ratio: 1.0,
            database_path: None,
            rpc_strict_params: false,
            http: HttpConfig::default(),
            torrent: TorrentConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolved database path: explicit setting or `<download_dir>/fetchd.db`.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.download_dir.join("fetchd.db"))
    }
}

/// HTTP sub-configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Seconds allowed for TCP/TLS establishment.
    pub connect_timeout: u64,
    /// Seconds a body read may stall before failing the request.
    pub read_timeout: u64,
    pub max_redirects: usize,
    /// Retry budget per segment for transient failures.
    pub max_retries: u32,
    /// Base backoff delay for the first retry.
    pub retry_delay_ms: u64,
    /// Backoff delay cap.
    pub max_retry_delay_ms: u64,
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            accept_invalid_certs: false,
        }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

/// BitTorrent sub-configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentConfig {
    /// Inclusive TCP port range the peer listener binds within.
    pub listen_port_range: (u16, u16),
    /// `host:port` DHT bootstrap nodes.
    pub dht_bootstrap_nodes: Vec<String>,
    /// Seconds between full tracker re-announces.
    pub tracker_update_interval: u64,
    /// Seconds of silence before a peer is dropped.
    pub peer_timeout: u64,
    /// Outstanding block requests per peer.
    pub max_pending_requests: usize,
    pub enable_endgame: bool,
    pub enable_dht: bool,
    pub enable_pex: bool,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            listen_port_range: (6881, 6889),
            dht_bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            tracker_update_interval: 1800,
            peer_timeout: 120,
            max_pending_requests: 16,
            enable_endgame: true,
            enable_dht: true,
            enable_pex: true,
        }
    }
}

impl TorrentConfig {
    #[must_use]
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout)
    }
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_user_agent() -> String {
    format!("fetchd/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 5);
        assert_eq!(cfg.max_connections_per_download, 16);
        assert_eq!(cfg.min_segment_size, 1024 * 1024);
        assert_eq!(cfg.global_download_limit, 0);
        assert_eq!(cfg.max_peers, 55);
        assert!((cfg.seed_ratio - 1.0).abs() < f64::EPSILON);
        assert!(cfg.enable_dht && cfg.enable_pex && cfg.enable_lpd);
        assert_eq!(cfg.http.connect_timeout, 30);
        assert_eq!(cfg.http.read_timeout, 60);
        assert_eq!(cfg.http.max_redirects, 10);
        assert_eq!(cfg.http.max_retries, 3);
        assert_eq!(cfg.http.retry_delay_ms, 1000);
        assert_eq!(cfg.http.max_retry_delay_ms, 30_000);
        assert!(!cfg.http.accept_invalid_certs);
        assert_eq!(cfg.torrent.listen_port_range, (6881, 6889));
        assert_eq!(cfg.torrent.tracker_update_interval, 1800);
        assert_eq!(cfg.torrent.peer_timeout, 120);
        assert_eq!(cfg.torrent.max_pending_requests, 16);
        assert!(cfg.torrent.enable_endgame);
    }

    #[test]
    fn test_settings_round_trip_ignores_unknown_keys() {
        let mut value = serde_json::to_value(EngineConfig::default()).unwrap();
        value["some_future_option"] = serde_json::json!(true);
        value["max_peers"] = serde_json::json!(80);
        let cfg: EngineConfig = serde_json::from_value(value).unwrap();
        assert_eq!(cfg.max_peers, 80);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"max_concurrent_downloads": 2}"#).unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 2);
        assert_eq!(cfg.max_connections_per_download, 16);
    }

    #[test]
    fn test_database_path_defaults_under_download_dir() {
        let mut cfg = EngineConfig::default();
        cfg.download_dir = PathBuf::from("/data/dl");
        assert_eq!(cfg.database_path(), PathBuf::from("/data/dl/fetchd.db"));
        cfg.database_path = Some(PathBuf::from("/var/lib/fetchd.db"));
        assert_eq!(cfg.database_path(), PathBuf::from("/var/lib/fetchd.db"));
    }
}
