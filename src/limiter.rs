//! Token-bucket rate limiting for transfer bandwidth.
//!
//! One bucket per scope: a global pair (download/upload) plus an optional
//! pair per download. Bucket capacity equals one second of the configured
//! rate and refill is continuous. Acquisition composes: a chunk is written
//! only once both the per-download and the global bucket admit it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::record::DownloadId;

/// A single token bucket. Shared across tasks behind an `Arc`.
///
/// A rate of zero disables the bucket entirely: `acquire` returns
/// immediately and no state is tracked.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; 0 = unlimited.
    rate: AtomicU64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Available tokens (bytes). May go negative as a deficit so large
    /// chunks keep long-run throughput at the configured rate.
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter at the given rate in bytes per second.
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            state: Mutex::new(Bucket {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a limiter that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current rate in bytes per second; 0 = unlimited.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Changes the rate. Takes effect on the next acquisition.
    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
        debug!(rate, "limiter rate updated");
    }

    /// Waits until `n` bytes may pass, then consumes them.
    pub async fn acquire(&self, n: u64) {
        let rate = self.rate();
        if rate == 0 || n == 0 {
            return;
        }
        let rate_f = rate as f64;
        let capacity = rate_f;

        let wait = {
            let mut bucket = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.last_refill = now;
            bucket.tokens = (bucket.tokens + elapsed * rate_f).min(capacity);
            bucket.tokens -= n as f64;
            if bucket.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.tokens / rate_f))
            }
        };

        if let Some(delay) = wait {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Per-download limiter pair.
#[derive(Debug)]
struct DownloadLimiters {
    download: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

/// Registry composing the global buckets with per-download ones.
#[derive(Debug)]
pub struct LimiterRegistry {
    global_download: Arc<RateLimiter>,
    global_upload: Arc<RateLimiter>,
    per_download: DashMap<DownloadId, Arc<DownloadLimiters>>,
}

impl LimiterRegistry {
    /// Creates the registry with global rates (0 = unlimited).
    #[must_use]
    pub fn new(global_download: u64, global_upload: u64) -> Self {
        Self {
            global_download: Arc::new(RateLimiter::new(global_download)),
            global_upload: Arc::new(RateLimiter::new(global_upload)),
            per_download: DashMap::new(),
        }
    }

    /// Updates the global rates in place.
    pub fn set_global_rates(&self, download: u64, upload: u64) {
        self.global_download.set_rate(download);
        self.global_upload.set_rate(upload);
    }

    /// Current global (download, upload) rates.
    #[must_use]
    pub fn global_rates(&self) -> (u64, u64) {
        (self.global_download.rate(), self.global_upload.rate())
    }

    /// Sets a per-download rate pair, creating the bucket on first use.
    pub fn set_download_rates(&self, id: &DownloadId, download: u64, upload: u64) {
        let entry = self.entry(id);
        entry.download.set_rate(download);
        entry.upload.set_rate(upload);
    }

    /// Drops the per-download buckets once the record is removed.
    pub fn forget(&self, id: &DownloadId) {
        self.per_download.remove(id);
    }

    /// Gates `n` received bytes for a download (per-download, then global).
    pub async fn acquire_download(&self, id: &DownloadId, n: u64) {
        if let Some(entry) = self.per_download.get(id).map(|e| Arc::clone(&e)) {
            entry.download.acquire(n).await;
        }
        self.global_download.acquire(n).await;
    }

    /// Gates `n` sent bytes for a download (per-download, then global).
    pub async fn acquire_upload(&self, id: &DownloadId, n: u64) {
        if let Some(entry) = self.per_download.get(id).map(|e| Arc::clone(&e)) {
            entry.upload.acquire(n).await;
        }
        self.global_upload.acquire(n).await;
    }

    fn entry(&self, id: &DownloadId) -> Arc<DownloadLimiters> {
        self.per_download
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(DownloadLimiters {
                    download: Arc::new(RateLimiter::unlimited()),
                    upload: Arc::new(RateLimiter::unlimited()),
                })
            })
            .clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_delays() {
        tokio::time::pause();
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(10_000_000).await;
        limiter.acquire(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_first_second_passes_within_capacity() {
        tokio::time::pause();
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        // Bucket starts full: one second of rate is free.
        limiter.acquire(1000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_sustained_rate_is_enforced() {
        tokio::time::pause();
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        // 3000 bytes at 1000 B/s: the first 1000 are free (full bucket),
        // the remaining 2000 must take ~2 seconds.
        for _ in 0..3 {
            limiter.acquire(1000).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(1900));
        assert!(start.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_oversized_chunk_incurs_proportional_delay() {
        tokio::time::pause();
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await; // drain the initial capacity
        let start = Instant::now();
        limiter.acquire(5000).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_set_rate_zero_disables() {
        tokio::time::pause();
        let limiter = RateLimiter::new(10);
        limiter.set_rate(0);
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_registry_composes_per_download_and_global() {
        tokio::time::pause();
        let registry = LimiterRegistry::new(0, 0);
        let id = DownloadId::generate();
        registry.set_download_rates(&id, 1000, 0);

        let start = Instant::now();
        registry.acquire_download(&id, 1000).await; // initial capacity
        registry.acquire_download(&id, 1000).await; // ~1 s from per-download bucket
        assert!(start.elapsed() >= Duration::from_millis(900));

        // A different download is not limited.
        let other = DownloadId::generate();
        let start = Instant::now();
        registry.acquire_download(&other, 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_registry_forget_removes_limits() {
        tokio::time::pause();
        let registry = LimiterRegistry::new(0, 0);
        let id = DownloadId::generate();
        registry.set_download_rates(&id, 10, 10);
        registry.forget(&id);
        let start = Instant::now();
        registry.acquire_download(&id, 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
