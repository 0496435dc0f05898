//! Shared helpers for integration tests.

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use fetchd_core::config::EngineConfig;
use fetchd_core::record::{DownloadId, DownloadState};
use fetchd_core::Controller;

/// Each test gets its own listener port range so parallel tests never
/// fight over sockets.
static NEXT_PORT: AtomicU16 = AtomicU16::new(41000);

/// Engine config pointing at a temp dir with networking extras disabled.
pub fn test_config(dir: &Path) -> EngineConfig {
    let low = NEXT_PORT.fetch_add(4, Ordering::Relaxed);
    let mut config = EngineConfig::default();
    config.download_dir = dir.to_path_buf();
    config.enable_dht = false;
    config.enable_lpd = false;
    config.enable_pex = false;
    config.torrent.listen_port_range = (low, low + 3);
    config.torrent.dht_bootstrap_nodes = Vec::new();
    config.http.retry_delay_ms = 100;
    config.http.max_retry_delay_ms = 500;
    config
}

/// Polls the controller until the download reaches a matching state.
///
/// Panics (failing the test) with the last observed state on timeout.
pub async fn wait_for_state(
    controller: &Controller,
    gid: &DownloadId,
    timeout: Duration,
    predicate: impl Fn(&DownloadState) -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        if let Ok(status) = controller.status(gid) {
            if predicate(&status.state) {
                return;
            }
            last = Some(status.state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("download {gid} did not reach expected state; last = {last:?}");
}
