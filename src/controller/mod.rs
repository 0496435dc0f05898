//! The controller: catalog owner, admission policy, command router.
//!
//! All downloads live in one catalog behind a single mutex; critical
//! sections do O(1)–O(n) bookkeeping and never await. Workers run in
//! their own tasks and talk back over the [`WorkerUpdate`] channel; the
//! controller translates updates into persisted records and published
//! events. Admission keeps at most `max_concurrent_downloads` records in
//! `Downloading`; ties between equal priorities break by insertion order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use base64::Engine as _;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::events::{EngineEvent, EventBus};
use crate::http::client::{HttpClient, RequestOptions};
use crate::http::task::HttpTaskParams;
use crate::limiter::LimiterRegistry;
use crate::record::{
    DownloadId, DownloadKind, DownloadRecord, DownloadSource, DownloadState, Priority, Segment,
    SegmentState,
};
use crate::storage::{Database, DownloadStore};
use crate::torrent::session::{LivePeer, SessionQuery, SwarmServices, TorrentFileInfo};
use crate::torrent::{self, MagnetLink, Metainfo, TorrentInput, TorrentParams};
use crate::worker::{ProgressSnapshot, WorkerContext, WorkerUpdate};

mod settings;

pub use settings::{ScheduleRule, UA_PRESETS, active_schedule_rule};

/// Minimum interval between `download:progress` events per download.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum interval between persisted progress snapshots per download.
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Zero forward progress for this long while active means stalled.
const STALL_THRESHOLD: Duration = Duration::from_secs(30);

/// Grace period for a cooperative pause before the worker is aborted.
const PAUSE_GRACE: Duration = Duration::from_secs(5);

/// Worker handle kept in the catalog.
struct Worker {
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

/// One catalog entry: the record plus live bookkeeping.
struct Entry {
    record: DownloadRecord,
    worker: Option<Worker>,
    progress: ProgressSnapshot,
    segments: Vec<Segment>,
    /// Torrent sessions answer peer/file queries over this channel.
    query_tx: Option<mpsc::Sender<SessionQuery>>,
    sequential: bool,
    last_progress_event: Instant,
    last_persist: Instant,
    last_forward_progress: Instant,
    last_completed: u64,
}

impl Entry {
    fn new(record: DownloadRecord) -> Self {
        let now = Instant::now();
        // Backdate the throttles so the first progress event and persist
        // are not swallowed.
        let backdated = |interval: Duration| now.checked_sub(interval).unwrap_or(now);
        Self {
            record,
            worker: None,
            progress: ProgressSnapshot::default(),
            segments: Vec::new(),
            query_tx: None,
            sequential: false,
            last_progress_event: backdated(PROGRESS_EVENT_INTERVAL),
            last_persist: backdated(PERSIST_INTERVAL),
            last_forward_progress: now,
            last_completed: 0,
        }
    }
}

struct Catalog {
    entries: HashMap<DownloadId, Entry>,
    /// Insertion order; the admission tie-breaker.
    order: Vec<DownloadId>,
}

/// Serializable status view for the RPC surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub gid: DownloadId,
    pub name: String,
    pub kind: DownloadKind,
    #[serde(flatten)]
    pub state: DownloadState,
    pub total_length: Option<u64>,
    pub completed_length: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub connections: u32,
    pub seeders: u32,
    pub save_path: String,
    pub files: Vec<String>,
    pub priority: Priority,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregate stats for `get_global_stats` and the `global-stats` event.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_active: u32,
    pub num_waiting: u32,
    pub num_stopped: u32,
}

/// Options accepted by the `add_*` calls.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub dir: Option<PathBuf>,
    pub filename: Option<String>,
    pub headers: std::collections::BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub checksum: Option<String>,
    pub priority: Option<Priority>,
    pub sequential: bool,
}

/// The engine controller. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    catalog: Mutex<Catalog>,
    store: Database,
    events: EventBus,
    config: RwLock<EngineConfig>,
    limiters: Arc<LimiterRegistry>,
    http: RwLock<HttpClient>,
    swarm: Arc<SwarmServices>,
    update_tx: mpsc::Sender<WorkerUpdate>,
    close_to_tray: AtomicBool,
    tracker_list: Mutex<Vec<String>>,
}

impl Controller {
    /// Builds the controller, binds the peer listener, starts the shared
    /// discovery services, loads persisted records, and re-admits work.
    ///
    /// # Errors
    ///
    /// Fatal startup failures only: unusable listen ports or an unusable
    /// HTTP client configuration.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        store: Database,
        events: EventBus,
    ) -> Result<Self, EngineError> {
        let limiters = Arc::new(LimiterRegistry::new(
            config.global_download_limit,
            config.global_upload_limit,
        ));
        let http = HttpClient::build(&config.http, &config.user_agent)?;

        let listener = torrent::listener::spawn(config.torrent.listen_port_range).await?;
        let dht = if config.enable_dht {
            torrent::dht::spawn(config.torrent.dht_bootstrap_nodes.clone(), 0).await
        } else {
            None
        };
        let (lpd_peer_tx, lpd_peer_rx) = mpsc::channel(64);
        let lpd = if config.enable_lpd {
            torrent::lpd::spawn(listener.port, lpd_peer_tx).await
        } else {
            None
        };

        let mut torrent_config = config.torrent.clone();
        torrent_config.enable_dht = config.enable_dht;
        torrent_config.enable_pex = config.enable_pex;
        let swarm = Arc::new(SwarmServices {
            config: torrent_config,
            max_peers: config.max_peers,
            seed_ratio: config.seed_ratio,
            peer_id: torrent::generate_peer_id(),
            listen_port: listener.port,
            registry: Arc::clone(&listener.registry),
            http: reqwest::Client::new(),
            dht,
            lpd,
            limiters: Arc::clone(&limiters),
        });

        let (update_tx, update_rx) = mpsc::channel(256);
        let controller = Self {
            inner: Arc::new(Inner {
                catalog: Mutex::new(Catalog { entries: HashMap::new(), order: Vec::new() }),
                store,
                events,
                config: RwLock::new(config),
                limiters,
                http: RwLock::new(http),
                swarm,
                update_tx,
                close_to_tray: AtomicBool::new(true),
                tracker_list: Mutex::new(Vec::new()),
            }),
        };

        controller.load_persisted_settings().await;
        controller.load_catalog().await;
        controller.spawn_update_loop(update_rx);
        controller.spawn_stats_loop();
        controller.spawn_lpd_router(lpd_peer_rx);
        controller.pump().await;
        Ok(controller)
    }

    /// Restores settings-table state (tracker list, tray flag).
    async fn load_persisted_settings(&self) {
        if let Ok(Some(json)) = self.inner.store.get_setting("tracker_list").await
            && let Ok(trackers) = serde_json::from_str::<Vec<String>>(&json)
            && let Ok(mut list) = self.inner.tracker_list.lock()
        {
            *list = trackers;
        }
        if let Ok(Some(value)) = self.inner.store.get_setting("close_to_tray").await {
            self.inner.close_to_tray.store(value == "true", Ordering::Relaxed);
        }
    }

    /// Loads persisted records, normalizing transient state.
    async fn load_catalog(&self) {
        let records = match self.inner.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to load persisted downloads");
                return;
            }
        };
        let mut catalog = self.lock_catalog();
        for mut record in records {
            if record.state.is_active() {
                // Active records from a previous process resume as queued.
                record.state = DownloadState::Queued;
            }
            let id = record.id.clone();
            catalog.entries.insert(id.clone(), Entry::new(record));
            catalog.order.push(id);
        }
        info!(count = catalog.order.len(), "catalog loaded");
    }

    fn lock_catalog(&self) -> std::sync::MutexGuard<'_, Catalog> {
        // A poisoned catalog means a panic mid-update; continuing with the
        // data is still the best option for a download manager.
        match self.inner.catalog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ------------------------------------------------------------------
    // Adding downloads
    // ------------------------------------------------------------------

    /// Adds an HTTP(S) download.
    ///
    /// # Errors
    ///
    /// `already_exists` when a live record has the same URL; `unknown`
    /// for unparseable URLs or checksums.
    pub async fn add_url(&self, url: &str, options: AddOptions) -> Result<DownloadId, EngineError> {
        let parsed = url::Url::parse(url)
            .map_err(|_| EngineError::fatal(ErrorKind::Unknown, format!("invalid URL: {url}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::fatal(
                ErrorKind::Unknown,
                format!("unsupported scheme: {}", parsed.scheme()),
            ));
        }
        if let Some(checksum) = &options.checksum {
            crate::http::checksum::Checksum::parse(checksum)?;
        }
        self.ensure_new_source(url)?;

        let name = options
            .filename
            .clone()
            .unwrap_or_else(|| crate::http::filename::filename_from_url(&parsed));
        let record = self.build_record(
            DownloadKind::Http,
            DownloadSource::Url { url: url.to_string() },
            name,
            &options,
        );
        self.insert_record(record, options.sequential).await
    }

    /// Adds a batch of URLs; failures are reported per URL.
    pub async fn add_urls(
        &self,
        urls: &[String],
        options: AddOptions,
    ) -> Vec<Result<DownloadId, EngineError>> {
        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            results.push(self.add_url(url, options.clone()).await);
        }
        results
    }

    /// Adds a download from `.torrent` file contents.
    ///
    /// # Errors
    ///
    /// `bencode_parse` for malformed metainfo, `already_exists` for a
    /// duplicate info hash.
    pub async fn add_torrent_blob(
        &self,
        blob: Vec<u8>,
        options: AddOptions,
    ) -> Result<DownloadId, EngineError> {
        let meta = Metainfo::from_bytes(&blob).map_err(|e| {
            EngineError::fatal(ErrorKind::BencodeParse, format!("torrent file: {e}"))
        })?;
        let info_hash_hex = meta.info_hash_hex();
        self.ensure_new_source(&info_hash_hex)?;

        let mut record = self.build_record(
            DownloadKind::Torrent,
            DownloadSource::Torrent { info_hash: info_hash_hex, blob },
            meta.name.clone(),
            &options,
        );
        record.total = Some(meta.total_size);
        record.piece_length = Some(meta.piece_length);
        self.insert_record(record, options.sequential).await
    }

    /// Adds a magnet download.
    ///
    /// # Errors
    ///
    /// `unknown` for malformed magnets, `already_exists` for a duplicate
    /// info hash.
    pub async fn add_magnet(&self, uri: &str, options: AddOptions) -> Result<DownloadId, EngineError> {
        let link = MagnetLink::parse(uri)
            .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("magnet: {e}")))?;
        self.ensure_new_source(&link.info_hash_hex())?;

        let name = link
            .display_name
            .clone()
            .unwrap_or_else(|| link.info_hash_hex());
        let mut record = self.build_record(
            DownloadKind::Magnet,
            DownloadSource::Magnet { uri: uri.to_string() },
            name,
            &options,
        );
        record.total = link.exact_length;
        self.insert_record(record, options.sequential).await
    }

    fn build_record(
        &self,
        kind: DownloadKind,
        source: DownloadSource,
        name: String,
        options: &AddOptions,
    ) -> DownloadRecord {
        let config = self.config();
        let save_dir = options.dir.clone().unwrap_or_else(|| config.download_dir.clone());
        let mut record = DownloadRecord::new(kind, source, name, save_dir);
        record.headers = options.headers.clone();
        record.user_agent = options.user_agent.clone();
        record.referrer = options.referrer.clone();
        record.checksum = options.checksum.clone();
        record.priority = options.priority.unwrap_or_default();
        if let Some(filename) = &options.filename {
            record.files = vec![crate::http::filename::sanitize_filename(filename)];
        }
        record
    }

    /// Rejects a source already present in a non-terminal record.
    ///
    /// Torrents and magnets dedupe on the info hash, HTTP on the URL.
    fn ensure_new_source(&self, target: &str) -> Result<(), EngineError> {
        let catalog = self.lock_catalog();
        let duplicate = catalog.entries.values().any(|entry| {
            source_identity(&entry.record.source) == target && !entry.record.state.is_terminal()
        });
        if duplicate {
            return Err(EngineError::fatal(
                ErrorKind::AlreadyExists,
                format!("already downloading {target}"),
            ));
        }
        Ok(())
    }

    async fn insert_record(
        &self,
        record: DownloadRecord,
        sequential: bool,
    ) -> Result<DownloadId, EngineError> {
        let id = record.id.clone();
        if let Err(e) = self.inner.store.save_download(&record).await {
            warn!(error = %e, "failed to persist new download");
        }
        let event = EngineEvent::Added {
            gid: id.clone(),
            name: record.name.clone(),
            kind: record.kind,
        };
        {
            let mut catalog = self.lock_catalog();
            let mut entry = Entry::new(record);
            entry.sequential = sequential;
            catalog.entries.insert(id.clone(), entry);
            catalog.order.push(id.clone());
        }
        self.inner.events.publish(event);
        self.pump().await;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admits queued records while slots are free. Highest priority wins;
    /// equal priorities admit in insertion order.
    async fn pump(&self) {
        loop {
            let candidate = {
                let catalog = self.lock_catalog();
                let max = self.config().max_concurrent_downloads;
                let active = catalog
                    .entries
                    .values()
                    .filter(|e| e.record.state.is_active())
                    .count();
                if active >= max {
                    None
                } else {
                    catalog
                        .order
                        .iter()
                        .enumerate()
                        .filter_map(|(idx, id)| {
                            let entry = catalog.entries.get(id)?;
                            matches!(entry.record.state, DownloadState::Queued)
                                .then(|| (entry.record.priority.rank(), idx, id.clone()))
                        })
                        .min()
                        .map(|(_, _, id)| id)
                }
            };
            let Some(id) = candidate else { return };
            if let Err(error) = self.admit(&id).await {
                warn!(%id, error = %error, "failed to start download");
                self.fail_download(&id, error).await;
            }
        }
    }

    /// Spawns the worker for one queued record.
    async fn admit(&self, id: &DownloadId) -> Result<(), EngineError> {
        let segments = self.inner.store.load_segments(id).await.unwrap_or_default();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = WorkerContext::new(id.clone(), self.inner.update_tx.clone(), cancel_rx);

        let record = {
            let mut catalog = self.lock_catalog();
            let entry = catalog
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
            if !matches!(entry.record.state, DownloadState::Queued) {
                return Ok(());
            }

            let join = match entry.record.kind {
                DownloadKind::Http => {
                    let params = http_params(&entry.record, segments, &self.config());
                    let client = self.http_client();
                    let limiters = Arc::clone(&self.inner.limiters);
                    tokio::spawn(crate::http::task::run(params, client, limiters, ctx))
                }
                DownloadKind::Torrent | DownloadKind::Magnet => {
                    let input = torrent_input(&entry.record)?;
                    let (query_tx, query_rx) = mpsc::channel(8);
                    entry.query_tx = Some(query_tx);
                    let params = TorrentParams {
                        input,
                        save_dir: entry.record.save_dir.clone(),
                        sequential: entry.sequential,
                        resume_have: entry.record.have_bitfield.clone(),
                        extra_trackers: self.tracker_list(),
                    };
                    let services = Arc::clone(&self.inner.swarm);
                    tokio::spawn(torrent::session::run(params, services, ctx, query_rx))
                }
            };

            entry.worker = Some(Worker { cancel: cancel_tx, join });
            entry.record.state = DownloadState::Downloading;
            entry.record.touch();
            entry.last_forward_progress = Instant::now();
            entry.record.clone()
        };

        self.persist(&record).await;
        self.inner.events.publish(EngineEvent::Started { gid: id.clone() });
        self.inner.events.publish(EngineEvent::StateChanged {
            gid: id.clone(),
            state: DownloadState::Downloading,
        });
        debug!(%id, "download started");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle commands
    // ------------------------------------------------------------------

    /// Pauses a download. Idempotent on paused records.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids.
    pub async fn pause(&self, id: &DownloadId) -> Result<(), EngineError> {
        let (worker, already) = {
            let mut catalog = self.lock_catalog();
            let entry = catalog
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
            if matches!(entry.record.state, DownloadState::Paused) {
                (None, true)
            } else if entry.record.state.is_terminal() {
                return Ok(());
            } else {
                entry.record.state = DownloadState::Paused;
                entry.record.touch();
                (entry.worker.take(), false)
            }
        };
        if already {
            return Ok(());
        }

        if let Some(worker) = worker {
            stop_worker(worker).await;
        }
        let record = self.record_snapshot(id);
        if let Some(record) = record {
            self.persist(&record).await;
            self.persist_segments(id).await;
        }
        self.inner.events.publish(EngineEvent::Paused { gid: id.clone() });
        self.inner.events.publish(EngineEvent::StateChanged {
            gid: id.clone(),
            state: DownloadState::Paused,
        });
        self.pump().await;
        Ok(())
    }

    /// Resumes a paused or failed download. No-op while downloading.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids.
    pub async fn resume(&self, id: &DownloadId) -> Result<(), EngineError> {
        {
            let mut catalog = self.lock_catalog();
            let entry = catalog
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
            match entry.record.state {
                DownloadState::Paused | DownloadState::Error { .. } => {
                    entry.record.state = DownloadState::Queued;
                    entry.record.error = None;
                    entry.record.touch();
                }
                // Resuming an active or queued record changes nothing.
                _ => return Ok(()),
            }
        }
        if let Some(record) = self.record_snapshot(id) {
            self.persist(&record).await;
        }
        self.inner.events.publish(EngineEvent::Resumed { gid: id.clone() });
        self.pump().await;
        Ok(())
    }

    /// Pauses every non-terminal download.
    pub async fn pause_all(&self) {
        for id in self.ids() {
            let _ = self.pause(&id).await;
        }
    }

    /// Resumes every paused download.
    pub async fn resume_all(&self) {
        for id in self.ids() {
            let _ = self.resume(&id).await;
        }
    }

    /// Removes a download, optionally deleting the on-disk artifact.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids.
    pub async fn remove(&self, id: &DownloadId, delete_files: bool) -> Result<(), EngineError> {
        let (worker, record) = {
            let mut catalog = self.lock_catalog();
            let entry = catalog
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
            (entry.worker.take(), entry.record.clone())
        };

        // The worker terminates before anything is deleted.
        if let Some(worker) = worker {
            stop_worker(worker).await;
        }
        {
            let mut catalog = self.lock_catalog();
            catalog.entries.remove(id);
            catalog.order.retain(|other| other != id);
        }
        if let Err(e) = self.inner.store.delete_download(id).await {
            warn!(error = %e, "failed to delete download record");
        }
        self.inner.limiters.forget(id);

        if delete_files {
            delete_artifacts(&record);
        }
        self.inner.events.publish(EngineEvent::Removed { gid: id.clone() });
        self.pump().await;
        Ok(())
    }

    /// Reprioritizes a download; affects queue admission only.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids.
    pub async fn set_priority(&self, id: &DownloadId, priority: Priority) -> Result<(), EngineError> {
        let changed = {
            let mut catalog = self.lock_catalog();
            let entry = catalog
                .entries
                .get_mut(id)
                .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
            if entry.record.priority == priority {
                false
            } else {
                entry.record.priority = priority;
                entry.record.touch();
                true
            }
        };
        if changed {
            if let Some(record) = self.record_snapshot(id) {
                self.persist(&record).await;
            }
            self.pump().await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Status of one download.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids.
    pub fn status(&self, id: &DownloadId) -> Result<DownloadStatus, EngineError> {
        let catalog = self.lock_catalog();
        catalog
            .entries
            .get(id)
            .map(status_of)
            .ok_or_else(|| EngineError::not_found(format!("no download {id}")))
    }

    /// All downloads in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<DownloadStatus> {
        let catalog = self.lock_catalog();
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.entries.get(id))
            .map(status_of)
            .collect()
    }

    /// Downloads currently occupying a slot.
    #[must_use]
    pub fn active(&self) -> Vec<DownloadStatus> {
        self.all()
            .into_iter()
            .filter(|status| status.state.is_active())
            .collect()
    }

    /// Aggregate transfer stats.
    #[must_use]
    pub fn global_stats(&self) -> GlobalStats {
        let catalog = self.lock_catalog();
        let mut stats = GlobalStats {
            download_speed: 0,
            upload_speed: 0,
            num_active: 0,
            num_waiting: 0,
            num_stopped: 0,
        };
        for entry in catalog.entries.values() {
            match &entry.record.state {
                state if state.is_active() => {
                    stats.num_active += 1;
                    stats.download_speed += entry.progress.download_speed;
                    stats.upload_speed += entry.progress.upload_speed;
                }
                DownloadState::Queued => stats.num_waiting += 1,
                _ => stats.num_stopped += 1,
            }
        }
        stats
    }

    /// Live peers of a torrent download.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown ids or downloads without a running session.
    pub async fn peers(&self, id: &DownloadId) -> Result<Vec<LivePeer>, EngineError> {
        let query_tx = self.session_query_tx(id)?;
        let (reply, rx) = oneshot::channel();
        query_tx
            .send(SessionQuery::Peers(reply))
            .await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))?;
        rx.await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))
    }

    /// Files of a torrent download.
    ///
    /// # Errors
    ///
    /// As for [`peers`](Self::peers).
    pub async fn torrent_files(&self, id: &DownloadId) -> Result<Vec<TorrentFileInfo>, EngineError> {
        let query_tx = self.session_query_tx(id)?;
        let (reply, rx) = oneshot::channel();
        query_tx
            .send(SessionQuery::Files(reply))
            .await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))?;
        rx.await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))
    }

    /// Applies a torrent file selection.
    ///
    /// # Errors
    ///
    /// As for [`peers`](Self::peers); `unknown` for invalid indices.
    pub async fn select_torrent_files(
        &self,
        id: &DownloadId,
        indices: Vec<usize>,
    ) -> Result<(), EngineError> {
        let query_tx = self.session_query_tx(id)?;
        let (reply, rx) = oneshot::channel();
        query_tx
            .send(SessionQuery::SelectFiles(indices, reply))
            .await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))?;
        let ok = rx
            .await
            .map_err(|_| EngineError::not_found(format!("session gone for {id}")))?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::fatal(ErrorKind::Unknown, "invalid file selection"))
        }
    }

    fn session_query_tx(&self, id: &DownloadId) -> Result<mpsc::Sender<SessionQuery>, EngineError> {
        let catalog = self.lock_catalog();
        let entry = catalog
            .entries
            .get(id)
            .ok_or_else(|| EngineError::not_found(format!("no download {id}")))?;
        entry
            .query_tx
            .clone()
            .ok_or_else(|| EngineError::not_found(format!("{id} has no torrent session")))
    }

    // ------------------------------------------------------------------
    // Settings / limits
    // ------------------------------------------------------------------

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        match self.inner.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn http_client(&self) -> HttpClient {
        match self.inner.http.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sets speed limits: global when `id` is `None`, per-download
    /// otherwise. Zero means unlimited.
    ///
    /// # Errors
    ///
    /// `not_found` for unknown per-download ids.
    pub async fn set_speed_limit(
        &self,
        id: Option<&DownloadId>,
        download: u64,
        upload: u64,
    ) -> Result<(), EngineError> {
        match id {
            Some(id) => {
                {
                    let catalog = self.lock_catalog();
                    if !catalog.entries.contains_key(id) {
                        return Err(EngineError::not_found(format!("no download {id}")));
                    }
                }
                self.inner.limiters.set_download_rates(id, download, upload);
            }
            None => {
                self.inner.limiters.set_global_rates(download, upload);
                if let Ok(mut config) = self.inner.config.write() {
                    config.global_download_limit = download;
                    config.global_upload_limit = upload;
                }
                self.persist_config().await;
            }
        }
        Ok(())
    }

    /// Merges a settings patch into the configuration and persists it.
    ///
    /// # Errors
    ///
    /// `unknown` when the patch produces an undecodable configuration.
    pub async fn update_settings(&self, patch: serde_json::Value) -> Result<EngineConfig, EngineError> {
        let mut value = serde_json::to_value(self.config())
            .map_err(|e| EngineError::fatal(ErrorKind::Unknown, e.to_string()))?;
        merge_json(&mut value, patch);
        let updated: EngineConfig = serde_json::from_value(value)
            .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("settings: {e}")))?;
        if let Ok(mut config) = self.inner.config.write() {
            *config = updated.clone();
        }
        self.persist_config().await;
        Ok(updated)
    }

    /// Applies the stored settings to running subsystems: limiters and
    /// the HTTP client. Listener/DHT changes require a restart.
    ///
    /// # Errors
    ///
    /// `unknown` when the HTTP client cannot be rebuilt.
    pub async fn apply_settings(&self) -> Result<(), EngineError> {
        let config = self.config();
        self.inner
            .limiters
            .set_global_rates(config.global_download_limit, config.global_upload_limit);
        let client = HttpClient::build(&config.http, &config.user_agent)?;
        if let Ok(mut http) = self.inner.http.write() {
            *http = client;
        }
        self.pump().await;
        Ok(())
    }

    async fn persist_config(&self) {
        let config = self.config();
        if let Ok(json) = serde_json::to_string(&config)
            && let Err(e) = self.inner.store.set_setting("engine_config", &json).await
        {
            warn!(error = %e, "failed to persist settings");
        }
    }

    /// Sets the engine user agent.
    pub async fn set_user_agent(&self, user_agent: &str) -> Result<(), EngineError> {
        if let Ok(mut config) = self.inner.config.write() {
            config.user_agent = user_agent.to_string();
        }
        self.persist_config().await;
        self.apply_settings().await
    }

    /// Host-side close-to-tray flag, stored for the host to read back.
    pub async fn set_close_to_tray(&self, value: bool) {
        self.inner.close_to_tray.store(value, Ordering::Relaxed);
        let _ = self
            .inner
            .store
            .set_setting("close_to_tray", if value { "true" } else { "false" })
            .await;
    }

    #[must_use]
    pub fn close_to_tray(&self) -> bool {
        self.inner.close_to_tray.load(Ordering::Relaxed)
    }

    /// User tracker list merged into new torrents.
    #[must_use]
    pub fn tracker_list(&self) -> Vec<String> {
        self.inner.tracker_list.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Replaces the user tracker list.
    pub async fn set_tracker_list(&self, trackers: Vec<String>) {
        if let Ok(mut list) = self.inner.tracker_list.lock() {
            *list = trackers.clone();
        }
        if let Ok(json) = serde_json::to_string(&trackers) {
            let _ = self.inner.store.set_setting("tracker_list", &json).await;
        }
    }

    /// Direct settings-table access for the `db_*` passthroughs.
    #[must_use]
    pub fn store(&self) -> &Database {
        &self.inner.store
    }

    /// Event bus handle for subscribers (RPC front-end, tests).
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Cancels all workers, waits out a drain deadline, snapshots state.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let workers: Vec<(DownloadId, Worker)> = {
            let mut catalog = self.lock_catalog();
            let ids: Vec<DownloadId> = catalog.entries.keys().cloned().collect();
            ids.into_iter()
                .filter_map(|id| {
                    catalog.entries.get_mut(&id).and_then(|e| e.worker.take()).map(|w| (id, w))
                })
                .collect()
        };
        for (_, worker) in &workers {
            let _ = worker.cancel.send(true);
        }
        for (_, worker) in workers {
            let mut join = worker.join;
            if tokio::time::timeout(PAUSE_GRACE, &mut join).await.is_err() {
                // Drain deadline passed; force termination.
                join.abort();
            }
        }

        // Final snapshot of every record and segment table.
        let snapshot: Vec<(DownloadRecord, Vec<Segment>)> = {
            let catalog = self.lock_catalog();
            catalog
                .order
                .iter()
                .filter_map(|id| catalog.entries.get(id))
                .map(|entry| (entry.record.clone(), entry.segments.clone()))
                .collect()
        };
        for (record, segments) in snapshot {
            self.persist(&record).await;
            if !segments.is_empty() {
                let mut normalized = segments;
                for seg in &mut normalized {
                    if seg.state == SegmentState::Downloading {
                        seg.state = SegmentState::Pending;
                    }
                }
                if let Err(e) = self.inner.store.save_segments(&record.id, &normalized).await {
                    warn!(error = %e, "failed to snapshot segments");
                }
            }
        }
        info!("shutdown snapshot complete");
    }

    // ------------------------------------------------------------------
    // Worker update processing
    // ------------------------------------------------------------------

    fn spawn_update_loop(&self, mut rx: mpsc::Receiver<WorkerUpdate>) {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                controller.handle_update(update).await;
            }
        });
    }

    async fn handle_update(&self, update: WorkerUpdate) {
        match update {
            WorkerUpdate::Resolved { id, info } => {
                let record = {
                    let mut catalog = self.lock_catalog();
                    let Some(entry) = catalog.entries.get_mut(&id) else { return };
                    if let Some(name) = info.name {
                        entry.record.name = name;
                    }
                    if info.total.is_some() {
                        entry.record.total = info.total;
                    }
                    if !info.files.is_empty() {
                        entry.record.files = info.files;
                    }
                    if info.etag.is_some() {
                        entry.record.etag = info.etag;
                    }
                    if info.last_modified.is_some() {
                        entry.record.last_modified = info.last_modified;
                    }
                    if let Some(supports) = info.supports_range {
                        entry.record.supports_range = supports;
                    }
                    if info.piece_length.is_some() {
                        entry.record.piece_length = info.piece_length;
                    }
                    entry.record.touch();
                    entry.record.clone()
                };
                self.persist(&record).await;
            }
            WorkerUpdate::Progress { id, snapshot } => {
                self.handle_progress(&id, snapshot).await;
            }
            WorkerUpdate::RestartedFromZero { id } => {
                let record = {
                    let mut catalog = self.lock_catalog();
                    let Some(entry) = catalog.entries.get_mut(&id) else { return };
                    entry.record.completed = 0;
                    entry.record.etag = None;
                    entry.record.last_modified = None;
                    entry.segments.clear();
                    entry.progress = ProgressSnapshot::default();
                    entry.record.touch();
                    entry.record.clone()
                };
                self.persist(&record).await;
                let _ = self.inner.store.save_segments(&id, &[]).await;
                self.inner.events.publish(EngineEvent::StateChanged {
                    gid: id,
                    state: DownloadState::Downloading,
                });
            }
            WorkerUpdate::Retrying { id, attempt, max } => {
                let state = DownloadState::Retrying { attempt, max };
                {
                    let mut catalog = self.lock_catalog();
                    let Some(entry) = catalog.entries.get_mut(&id) else { return };
                    if !entry.record.state.is_active() {
                        return;
                    }
                    entry.record.state = state.clone();
                }
                self.inner.events.publish(EngineEvent::StateChanged { gid: id, state });
            }
            WorkerUpdate::Segments { id, segments } => {
                let persist_now = {
                    let mut catalog = self.lock_catalog();
                    let Some(entry) = catalog.entries.get_mut(&id) else { return };
                    entry.segments = segments;
                    entry.last_persist.elapsed() >= PERSIST_INTERVAL
                };
                if persist_now {
                    self.persist_segments(&id).await;
                }
            }
            WorkerUpdate::Bitfield { id, have } => {
                let record = {
                    let mut catalog = self.lock_catalog();
                    let Some(entry) = catalog.entries.get_mut(&id) else { return };
                    entry.record.have_bitfield = Some(have);
                    if entry.last_persist.elapsed() < PERSIST_INTERVAL {
                        None
                    } else {
                        entry.last_persist = Instant::now();
                        Some(entry.record.clone())
                    }
                };
                if let Some(record) = record {
                    self.persist(&record).await;
                }
            }
            WorkerUpdate::Finished { id, result } => match result {
                Ok(()) => self.complete_download(&id).await,
                Err(error) => self.fail_download(&id, error).await,
            },
        }
    }

    async fn handle_progress(&self, id: &DownloadId, snapshot: ProgressSnapshot) {
        let (event, state_change, record) = {
            let mut catalog = self.lock_catalog();
            let Some(entry) = catalog.entries.get_mut(id) else { return };
            if !entry.record.state.is_active() {
                return;
            }

            entry.progress = snapshot;
            entry.record.completed = snapshot.completed;
            if snapshot.total.is_some() {
                entry.record.total = snapshot.total;
            }

            // Stall bookkeeping: forward progress resets the clock.
            let mut state_change = None;
            if snapshot.completed > entry.last_completed {
                entry.last_completed = snapshot.completed;
                entry.last_forward_progress = Instant::now();
                if !matches!(entry.record.state, DownloadState::Downloading) {
                    entry.record.state = DownloadState::Downloading;
                    state_change = Some(DownloadState::Downloading);
                }
            } else if entry.last_forward_progress.elapsed() >= STALL_THRESHOLD
                && matches!(entry.record.state, DownloadState::Downloading)
            {
                entry.record.state = DownloadState::Stalled;
                state_change = Some(DownloadState::Stalled);
            }

            let event = if entry.last_progress_event.elapsed() >= PROGRESS_EVENT_INTERVAL {
                entry.last_progress_event = Instant::now();
                Some(EngineEvent::Progress {
                    gid: id.clone(),
                    completed: snapshot.completed,
                    total: entry.record.total,
                    download_speed: snapshot.download_speed,
                    upload_speed: snapshot.upload_speed,
                    connections: snapshot.connections,
                    seeders: snapshot.seeders,
                })
            } else {
                None
            };

            let record = if entry.last_persist.elapsed() >= PERSIST_INTERVAL {
                entry.last_persist = Instant::now();
                Some(entry.record.clone())
            } else {
                None
            };
            (event, state_change, record)
        };

        if let Some(state) = state_change {
            self.inner
                .events
                .publish(EngineEvent::StateChanged { gid: id.clone(), state });
        }
        if let Some(event) = event {
            self.inner.events.publish(event);
        }
        if let Some(record) = record {
            self.persist(&record).await;
        }
    }

    async fn complete_download(&self, id: &DownloadId) {
        let record = {
            let mut catalog = self.lock_catalog();
            let Some(entry) = catalog.entries.get_mut(id) else { return };
            entry.worker = None;
            entry.query_tx = None;
            entry.record.mark_completed();
            entry.segments.clear();
            entry.record.clone()
        };
        self.persist(&record).await;
        let _ = self.inner.store.save_segments(id, &[]).await;
        self.inner.events.publish(EngineEvent::StateChanged {
            gid: id.clone(),
            state: DownloadState::Completed,
        });
        self.inner.events.publish(EngineEvent::Completed {
            gid: id.clone(),
            name: record.name.clone(),
            save_path: record.save_dir.join(&record.name).to_string_lossy().into_owned(),
        });
        info!(%id, name = %record.name, "download completed");
        self.pump().await;
    }

    async fn fail_download(&self, id: &DownloadId, error: EngineError) {
        let record = {
            let mut catalog = self.lock_catalog();
            let Some(entry) = catalog.entries.get_mut(id) else { return };
            entry.worker = None;
            entry.query_tx = None;
            entry.record.state = DownloadState::Error { kind: error.kind };
            entry.record.error = Some(error.message.clone());
            entry.record.touch();
            entry.record.clone()
        };
        self.persist(&record).await;
        self.inner.events.publish(EngineEvent::StateChanged {
            gid: id.clone(),
            state: record.state.clone(),
        });
        self.inner.events.publish(EngineEvent::Failed {
            gid: id.clone(),
            error: error.message.clone(),
            kind: error.kind,
            retryable: error.retryable,
        });
        warn!(%id, error = %error, "download failed");
        Box::pin(self.pump()).await;
    }

    // ------------------------------------------------------------------
    // Periodic engine tasks
    // ------------------------------------------------------------------

    fn spawn_stats_loop(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut seconds = 0u64;
            let mut schedule_active = false;
            loop {
                tick.tick().await;
                let stats = controller.global_stats();
                controller.inner.events.publish(EngineEvent::GlobalStats {
                    download_speed: stats.download_speed,
                    upload_speed: stats.upload_speed,
                    num_active: stats.num_active,
                    num_waiting: stats.num_waiting,
                    num_stopped: stats.num_stopped,
                });
                controller.detect_stalls();

                seconds += 1;
                if seconds % 60 == 0 {
                    schedule_active = controller.apply_schedule_rules(schedule_active).await;
                }
            }
        });
    }

    /// Applies alternative speed limits while a schedule window is
    /// active; restores the configured limits on exit. Returns whether a
    /// window is active now.
    async fn apply_schedule_rules(&self, was_active: bool) -> bool {
        let rules: Vec<ScheduleRule> = match self.inner.store.get_setting("schedule_rules").await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            _ => Vec::new(),
        };
        let minutes = settings::utc_minutes_now();
        match active_schedule_rule(&rules, minutes) {
            Some(rule) => {
                if !was_active {
                    info!(
                        start = %rule.start,
                        end = %rule.end,
                        "schedule window entered, applying alternative limits"
                    );
                }
                self.inner
                    .limiters
                    .set_global_rates(rule.download_limit, rule.upload_limit);
                true
            }
            None => {
                if was_active {
                    let config = self.config();
                    info!("schedule window left, restoring configured limits");
                    self.inner
                        .limiters
                        .set_global_rates(config.global_download_limit, config.global_upload_limit);
                }
                false
            }
        }
    }

    /// Marks active downloads with no forward progress for 30 s stalled.
    fn detect_stalls(&self) {
        let stalled: Vec<DownloadId> = {
            let mut catalog = self.lock_catalog();
            let mut hit = Vec::new();
            for (id, entry) in &mut catalog.entries {
                if matches!(entry.record.state, DownloadState::Downloading)
                    && entry.last_forward_progress.elapsed() >= STALL_THRESHOLD
                {
                    entry.record.state = DownloadState::Stalled;
                    hit.push(id.clone());
                }
            }
            hit
        };
        for id in stalled {
            self.inner.events.publish(EngineEvent::StateChanged {
                gid: id,
                state: DownloadState::Stalled,
            });
        }
    }

    fn spawn_lpd_router(&self, mut rx: mpsc::Receiver<crate::torrent::lpd::LpdPeer>) {
        let registry = Arc::clone(&self.inner.swarm.registry);
        tokio::spawn(async move {
            while let Some(peer) = rx.recv().await {
                let Ok(bytes) = hex::decode(&peer.info_hash_hex) else { continue };
                if bytes.len() != 20 {
                    continue;
                }
                let mut info_hash = [0u8; 20];
                info_hash.copy_from_slice(&bytes);
                if let Some(hooks) = registry.get(&info_hash).map(|h| h.clone()) {
                    let _ = hooks.discovered.send(peer.addr).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ids(&self) -> Vec<DownloadId> {
        self.lock_catalog().order.clone()
    }

    fn record_snapshot(&self, id: &DownloadId) -> Option<DownloadRecord> {
        self.lock_catalog().entries.get(id).map(|e| e.record.clone())
    }

    async fn persist(&self, record: &DownloadRecord) {
        if let Err(e) = self.inner.store.save_download(record).await {
            warn!(id = %record.id, error = %e, "failed to persist download");
        }
    }

    async fn persist_segments(&self, id: &DownloadId) {
        let segments = {
            let mut catalog = self.lock_catalog();
            let Some(entry) = catalog.entries.get_mut(id) else { return };
            entry.last_persist = Instant::now();
            entry.segments.clone()
        };
        if let Err(e) = self.inner.store.save_segments(id, &segments).await {
            warn!(%id, error = %e, "failed to persist segments");
        }
    }
}

/// Waits out the cooperative grace period, then aborts.
async fn stop_worker(worker: Worker) {
    let _ = worker.cancel.send(true);
    let mut join = worker.join;
    if tokio::time::timeout(PAUSE_GRACE, &mut join).await.is_err() {
        debug!("worker exceeded pause grace period, aborting");
        join.abort();
    }
}

fn status_of(entry: &Entry) -> DownloadStatus {
    DownloadStatus {
        gid: entry.record.id.clone(),
        name: entry.record.name.clone(),
        kind: entry.record.kind,
        state: entry.record.state.clone(),
        total_length: entry.record.total,
        completed_length: entry.record.completed,
        download_speed: entry.progress.download_speed,
        upload_speed: entry.progress.upload_speed,
        connections: entry.progress.connections,
        seeders: entry.progress.seeders,
        save_path: entry.record.save_dir.to_string_lossy().into_owned(),
        files: entry.record.files.clone(),
        priority: entry.record.priority,
        error: entry.record.error.clone(),
        created_at: entry.record.created_at,
        updated_at: entry.record.updated_at,
    }
}

fn http_params(record: &DownloadRecord, segments: Vec<Segment>, config: &EngineConfig) -> HttpTaskParams {
    let url = match &record.source {
        DownloadSource::Url { url } => url.clone(),
        _ => String::new(),
    };
    HttpTaskParams {
        url,
        save_dir: record.save_dir.clone(),
        name: record.files.first().cloned(),
        total: record.total,
        etag: record.etag.clone(),
        last_modified: record.last_modified.clone(),
        supports_range: record.supports_range,
        segments,
        checksum: record.checksum.clone(),
        options: RequestOptions {
            headers: record.headers.clone(),
            user_agent: record.user_agent.clone(),
            referrer: record.referrer.clone(),
        },
        max_connections: config.max_connections_per_download,
        min_segment_size: config.min_segment_size,
        retry: config.http.clone(),
    }
}

/// Canonical dedupe key: URL for HTTP, info hash for torrents/magnets.
fn source_identity(source: &DownloadSource) -> String {
    match source {
        DownloadSource::Url { url } => url.clone(),
        DownloadSource::Torrent { info_hash, .. } => info_hash.clone(),
        DownloadSource::Magnet { uri } => MagnetLink::parse(uri)
            .map(|link| link.info_hash_hex())
            .unwrap_or_else(|_| uri.clone()),
    }
}

fn torrent_input(record: &DownloadRecord) -> Result<TorrentInput, EngineError> {
    match &record.source {
        DownloadSource::Torrent { blob, .. } => {
            let meta = Metainfo::from_bytes(blob).map_err(|e| {
                EngineError::fatal(ErrorKind::BencodeParse, format!("stored torrent: {e}"))
            })?;
            Ok(TorrentInput::Metainfo(Box::new(meta)))
        }
        DownloadSource::Magnet { uri } => {
            let link = MagnetLink::parse(uri)
                .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("magnet: {e}")))?;
            Ok(TorrentInput::Magnet(link))
        }
        DownloadSource::Url { .. } => Err(EngineError::fatal(
            ErrorKind::Unknown,
            "HTTP record routed to torrent worker",
        )),
    }
}

fn delete_artifacts(record: &DownloadRecord) {
    for file in &record.files {
        let target = record.save_dir.join(file);
        let mut part = target.as_os_str().to_os_string();
        part.push(".part");
        let _ = std::fs::remove_file(&target);
        let _ = std::fs::remove_file(PathBuf::from(part));
    }
    if record.files.is_empty() {
        let target = record.save_dir.join(&record.name);
        let mut part = target.as_os_str().to_os_string();
        part.push(".part");
        let _ = std::fs::remove_file(&target);
        let _ = std::fs::remove_file(PathBuf::from(part));
    }
}

/// Recursive JSON merge: objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Decodes the `data` field of `add_torrent_file` / `parse_torrent_file`.
///
/// # Errors
///
/// `unknown` for undecodable base64.
pub fn decode_torrent_data(data: &str) -> Result<Vec<u8>, EngineError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("base64: {e}")))
}
