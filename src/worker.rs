//! Messages download workers send to the controller.
//!
//! Workers (the segmented HTTP task and the torrent session) own their
//! transfer state; the controller owns the catalog. This channel vocabulary
//! is the only thing that crosses the boundary: the controller translates
//! updates into persisted records and published events.

use tokio::sync::{mpsc, watch};

use crate::error::EngineError;
use crate::record::{DownloadId, Segment};

/// Periodic transfer snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: Option<u64>,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub connections: u32,
    pub seeders: u32,
}

/// Metadata a worker resolved about its download (HTTP probe results or
/// torrent metainfo).
#[derive(Debug, Clone, Default)]
pub struct ResolvedInfo {
    pub name: Option<String>,
    pub total: Option<u64>,
    pub files: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub supports_range: Option<bool>,
    pub piece_length: Option<u32>,
}

/// Everything a worker reports while running.
#[derive(Debug)]
pub enum WorkerUpdate {
    /// Size, name, validators or metainfo became known.
    Resolved { id: DownloadId, info: ResolvedInfo },
    /// Throttled transfer progress.
    Progress { id: DownloadId, snapshot: ProgressSnapshot },
    /// The server-side validator changed; the download restarted from zero.
    RestartedFromZero { id: DownloadId },
    /// A transient failure is being retried.
    Retrying { id: DownloadId, attempt: u32, max: u32 },
    /// HTTP segment table snapshot for persistence.
    Segments { id: DownloadId, segments: Vec<Segment> },
    /// Torrent have-bitfield snapshot for persistence.
    Bitfield { id: DownloadId, have: Vec<u8> },
    /// Terminal outcome; the worker has exited.
    Finished { id: DownloadId, result: Result<(), EngineError> },
}

/// The worker side of the control channels.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub id: DownloadId,
    updates: mpsc::Sender<WorkerUpdate>,
    cancel: watch::Receiver<bool>,
}

impl WorkerContext {
    #[must_use]
    pub fn new(
        id: DownloadId,
        updates: mpsc::Sender<WorkerUpdate>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self { id, updates, cancel }
    }

    /// Sends an update; a detached controller drops it.
    pub async fn send(&self, update: WorkerUpdate) {
        let _ = self.updates.send(update).await;
    }

    /// True once the controller asked this worker to stop.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested (or the controller is gone).
    pub async fn cancelled_wait(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_flag_observed() {
        let (update_tx, _update_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut ctx = WorkerContext::new(DownloadId::generate(), update_tx, cancel_rx);

        assert!(!ctx.cancelled());
        cancel_tx.send(true).unwrap();
        assert!(ctx.cancelled());
        // The wait resolves immediately once the flag is set.
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.cancelled_wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_after_controller_drop_is_silent() {
        let (update_tx, update_rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = WorkerContext::new(DownloadId::generate(), update_tx, cancel_rx);
        drop(update_rx);
        ctx.send(WorkerUpdate::RestartedFromZero { id: ctx.id.clone() }).await;
    }
}
