//! Engine event stream.
//!
//! Events are published on a broadcast channel. Any number of consumers may
//! subscribe; a slow consumer observes `RecvError::Lagged` and loses events
//! rather than back-pressuring producers. The RPC front-end forwards each
//! event to stdout as `{event, data}`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::record::{DownloadId, DownloadKind, DownloadState};

/// Broadcast channel depth before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything the engine announces about itself and its downloads.
///
/// Field names follow the wire contract (camelCase payload keys, the
/// download id exposed as `gid`).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    Added {
        gid: DownloadId,
        name: String,
        kind: DownloadKind,
    },
    Started {
        gid: DownloadId,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        gid: DownloadId,
        completed: u64,
        total: Option<u64>,
        download_speed: u64,
        upload_speed: u64,
        connections: u32,
        seeders: u32,
    },
    #[serde(rename_all = "camelCase")]
    StateChanged {
        gid: DownloadId,
        state: DownloadState,
    },
    Paused {
        gid: DownloadId,
    },
    Resumed {
        gid: DownloadId,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        gid: DownloadId,
        name: String,
        save_path: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        gid: DownloadId,
        error: String,
        kind: ErrorKind,
        retryable: bool,
    },
    Removed {
        gid: DownloadId,
    },
    #[serde(rename_all = "camelCase")]
    GlobalStats {
        download_speed: u64,
        upload_speed: u64,
        num_active: u32,
        num_waiting: u32,
        num_stopped: u32,
    },
    #[serde(rename_all = "camelCase")]
    EngineStatus {
        connected: bool,
        restarting: bool,
    },
}

impl EngineEvent {
    /// The event name published in the RPC envelope.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "download:added",
            Self::Started { .. } => "download:started",
            Self::Progress { .. } => "download:progress",
            Self::StateChanged { .. } => "download:state-changed",
            Self::Paused { .. } => "download:paused",
            Self::Resumed { .. } => "download:resumed",
            Self::Completed { .. } => "download:completed",
            Self::Failed { .. } => "download:failed",
            Self::Removed { .. } => "download:removed",
            Self::GlobalStats { .. } => "global-stats",
            Self::EngineStatus { .. } => "engine-status",
        }
    }
}

/// Shared broadcast bus for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Dropped silently when nobody subscribes.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes from the current position of the stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_wire_contract() {
        let gid = DownloadId::generate();
        assert_eq!(
            EngineEvent::Added {
                gid: gid.clone(),
                name: "x".into(),
                kind: DownloadKind::Http
            }
            .name(),
            "download:added"
        );
        assert_eq!(EngineEvent::Started { gid: gid.clone() }.name(), "download:started");
        assert_eq!(
            EngineEvent::EngineStatus { connected: true, restarting: false }.name(),
            "engine-status"
        );
        assert_eq!(
            EngineEvent::GlobalStats {
                download_speed: 0,
                upload_speed: 0,
                num_active: 0,
                num_waiting: 0,
                num_stopped: 0
            }
            .name(),
            "global-stats"
        );
    }

    #[test]
    fn test_payload_uses_camel_case_keys() {
        let event = EngineEvent::Progress {
            gid: DownloadId::generate(),
            completed: 10,
            total: Some(100),
            download_speed: 5,
            upload_speed: 0,
            connections: 4,
            seeders: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("downloadSpeed").is_some());
        assert!(value.get("uploadSpeed").is_some());
        assert!(value.get("download_speed").is_none());

        let stats = EngineEvent::GlobalStats {
            download_speed: 1,
            upload_speed: 2,
            num_active: 3,
            num_waiting: 4,
            num_stopped: 5,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["numActive"], 3);
        assert_eq!(value["numWaiting"], 4);
        assert_eq!(value["numStopped"], 5);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(EngineEvent::Started { gid: DownloadId::generate() });
        assert_eq!(a.recv().await.unwrap().name(), "download:started");
        assert_eq!(b.recv().await.unwrap().name(), "download:started");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            bus.publish(EngineEvent::EngineStatus { connected: true, restarting: false });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 10),
            other => panic!("expected lag marker, got {other:?}"),
        }
    }
}
