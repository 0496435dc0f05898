//! The per-download segmented HTTP worker.
//!
//! Probes the server, plans (or resumes) the segment partition, runs up
//! to `max_connections` ranged GETs writing into one pre-sized `.part`
//! file, retries transient failures per segment with jittered backoff,
//! restarts from zero when the server-side validator changes, verifies an
//! optional checksum, and renames the artifact into place on completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::checksum::Checksum;
use super::client::{HttpClient, Probe, RequestOptions};
use super::filename::{resolve_unique_path, sanitize_filename};
use super::segment::plan_segments;
use crate::config::HttpConfig;
use crate::error::{EngineError, ErrorKind};
use crate::limiter::LimiterRegistry;
use crate::record::{Segment, SegmentState};
use crate::worker::{ProgressSnapshot, ResolvedInfo, WorkerContext, WorkerUpdate};

/// Validator-change restarts tolerated before giving up.
const MAX_RESTARTS: u32 = 3;

/// Parameters the controller assembles from the download record.
#[derive(Debug, Clone)]
pub struct HttpTaskParams {
    pub url: String,
    pub save_dir: PathBuf,
    /// Resolved filename from a previous run, if any.
    pub name: Option<String>,
    pub total: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub supports_range: bool,
    /// Persisted segment table; empty for a fresh download.
    pub segments: Vec<Segment>,
    pub checksum: Option<String>,
    pub options: RequestOptions,
    pub max_connections: usize,
    pub min_segment_size: u64,
    pub retry: HttpConfig,
}

/// Runs the download. Sends [`WorkerUpdate::Finished`] unless cancelled.
#[instrument(skip_all, fields(id = %ctx.id, url = %params.url))]
pub async fn run(
    mut params: HttpTaskParams,
    client: HttpClient,
    limiters: Arc<LimiterRegistry>,
    mut ctx: WorkerContext,
) {
    let id = ctx.id.clone();
    match execute(&mut params, &client, &limiters, &mut ctx).await {
        Ok(End::Done) => {
            ctx.send(WorkerUpdate::Finished { id, result: Ok(()) }).await;
        }
        Ok(End::Cancelled) => {}
        Err(error) => {
            ctx.send(WorkerUpdate::Finished { id, result: Err(error) }).await;
        }
    }
}

enum End {
    Done,
    Cancelled,
}

async fn execute(
    params: &mut HttpTaskParams,
    client: &HttpClient,
    limiters: &Arc<LimiterRegistry>,
    ctx: &mut WorkerContext,
) -> Result<End, EngineError> {
    let checksum = params
        .checksum
        .as_deref()
        .map(Checksum::parse)
        .transpose()?;

    let mut restarts = 0u32;
    loop {
        if ctx.cancelled() {
            return Ok(End::Cancelled);
        }

        let probe = probe_with_retry(params, client, ctx).await?;

        // A changed validator invalidates everything downloaded so far.
        let validator_changed = params.segments.iter().any(|s| s.downloaded > 0)
            && validator_mismatch(params, &probe);
        if validator_changed {
            info!("validator changed on server, restarting from zero");
            restart_from_zero(params, ctx).await;
        }

        params.total = probe.total;
        params.etag = probe.etag.clone();
        params.last_modified = probe.last_modified.clone();
        params.supports_range = probe.supports_range;

        let (name, final_path) = resolve_output(params, &probe);
        params.name = Some(name.clone());
        ctx.send(WorkerUpdate::Resolved {
            id: ctx.id.clone(),
            info: ResolvedInfo {
                name: Some(name.clone()),
                total: probe.total,
                files: vec![name.clone()],
                etag: probe.etag.clone(),
                last_modified: probe.last_modified.clone(),
                supports_range: Some(probe.supports_range),
                ..ResolvedInfo::default()
            },
        })
        .await;

        let outcome = match (probe.total, probe.supports_range) {
            (Some(total), true) => {
                run_segmented(params, client, limiters, ctx, total, &final_path).await?
            }
            _ => run_sequential(params, client, limiters, ctx, &final_path).await?,
        };

        match outcome {
            Phase::Complete => {
                if let Some(checksum) = &checksum {
                    let part = part_path(&final_path);
                    checksum.verify_file(&part).await?;
                }
                finalize(&final_path)?;
                info!(path = %final_path.display(), "download complete");
                return Ok(End::Done);
            }
            Phase::Cancelled => return Ok(End::Cancelled),
            Phase::ValidatorChanged => {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    return Err(EngineError::fatal(
                        ErrorKind::ResumeNotSupported,
                        "server content keeps changing mid-download",
                    ));
                }
                restart_from_zero(params, ctx).await;
            }
        }
    }
}

enum Phase {
    Complete,
    Cancelled,
    ValidatorChanged,
}

async fn probe_with_retry(
    params: &HttpTaskParams,
    client: &HttpClient,
    ctx: &mut WorkerContext,
) -> Result<Probe, EngineError> {
    let mut attempt = 0u32;
    loop {
        match client.probe(&params.url, &params.options).await {
            Ok(probe) => return Ok(probe),
            Err(error) if error.retryable && attempt < params.retry.max_retries => {
                attempt += 1;
                ctx.send(WorkerUpdate::Retrying {
                    id: ctx.id.clone(),
                    attempt,
                    max: params.retry.max_retries,
                })
                .await;
                // A server-mandated Retry-After wins over our own backoff.
                let delay = error
                    .retry_after
                    .unwrap_or_else(|| backoff_delay(&params.retry, attempt));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "probe retry");
                tokio::time::sleep(delay).await;
                if ctx.cancelled() {
                    return Err(error);
                }
            }
            Err(error) => return Err(error),
        }
    }
}

fn validator_mismatch(params: &HttpTaskParams, probe: &Probe) -> bool {
    match (&params.etag, &probe.etag) {
        (Some(stored), Some(current)) => return stored != current,
        (Some(_), None) => return true,
        _ => {}
    }
    match (&params.last_modified, &probe.last_modified) {
        (Some(stored), Some(current)) => stored != current,
        (Some(_), None) => true,
        _ => false,
    }
}

async fn restart_from_zero(params: &mut HttpTaskParams, ctx: &mut WorkerContext) {
    params.segments.clear();
    params.etag = None;
    params.last_modified = None;
    ctx.send(WorkerUpdate::RestartedFromZero { id: ctx.id.clone() }).await;
    ctx.send(WorkerUpdate::Segments { id: ctx.id.clone(), segments: Vec::new() }).await;
}

/// Resolves the output filename and full path (without the `.part` suffix).
fn resolve_output(params: &HttpTaskParams, probe: &Probe) -> (String, PathBuf) {
    if let Some(name) = &params.name {
        // Resumed download: the path was fixed on the first run.
        return (name.clone(), params.save_dir.join(name));
    }
    let name = probe
        .filename
        .clone()
        .map(|n| sanitize_filename(&n))
        .unwrap_or_else(|| "download".to_string());
    let path = resolve_unique_path(&params.save_dir, &name);
    let resolved = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(name);
    (resolved, path)
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Renames `<name>.part` to `<name>` atomically.
fn finalize(final_path: &Path) -> Result<(), EngineError> {
    let part = part_path(final_path);
    std::fs::rename(&part, final_path)
        .map_err(|e| EngineError::file(&e, format!("renaming {}", part.display())))
}

/// Shared state between segment workers and the supervising loop.
struct SegmentedShared {
    file: std::fs::File,
    segments: std::sync::Mutex<Vec<Segment>>,
    downloaded: AtomicU64,
    validator_changed: AtomicBool,
}

async fn run_segmented(
    params: &mut HttpTaskParams,
    client: &HttpClient,
    limiters: &Arc<LimiterRegistry>,
    ctx: &mut WorkerContext,
    total: u64,
    final_path: &Path,
) -> Result<Phase, EngineError> {
    // Reuse the persisted partition when it still matches the size.
    let valid_resume = !params.segments.is_empty()
        && super::segment::is_valid_partition(&params.segments, total);
    let mut segments = if valid_resume {
        params.segments.clone()
    } else {
        plan_segments(total, params.max_connections, params.min_segment_size)
    };
    // Interrupted transfers resume at their recorded offset.
    for seg in &mut segments {
        if seg.state == SegmentState::Downloading {
            seg.state = SegmentState::Pending;
        }
    }

    std::fs::create_dir_all(&params.save_dir)
        .map_err(|e| EngineError::file(&e, format!("creating {}", params.save_dir.display())))?;
    let part = part_path(final_path);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&part)
        .map_err(|e| EngineError::file(&e, format!("opening {}", part.display())))?;
    file.set_len(total)
        .map_err(|e| EngineError::file(&e, format!("sizing {}", part.display())))?;

    let completed: u64 = segments.iter().map(|s| s.downloaded).sum();
    let shared = Arc::new(SegmentedShared {
        file,
        segments: std::sync::Mutex::new(segments.clone()),
        downloaded: AtomicU64::new(completed),
        validator_changed: AtomicBool::new(false),
    });
    ctx.send(WorkerUpdate::Segments { id: ctx.id.clone(), segments: segments.clone() }).await;

    let validator = params.etag.clone().or_else(|| params.last_modified.clone());
    let mut tasks = JoinSet::new();
    for seg in &segments {
        if seg.state == SegmentState::Completed {
            continue;
        }
        tasks.spawn(segment_worker(SegmentJob {
            url: params.url.clone(),
            segment: seg.clone(),
            validator: validator.clone(),
            options: params.options.clone(),
            retry: params.retry.clone(),
            client: client.clone(),
            limiters: Arc::clone(limiters),
            shared: Arc::clone(&shared),
            ctx: ctx.clone(),
        }));
    }

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_downloaded = shared.downloaded.load(Ordering::Relaxed);
    let mut cancel = ctx.clone();
    let mut failure: Option<EngineError> = None;

    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(error))) => {
                        // First hard failure wins; stop the others.
                        warn!(error = %error, "segment failed");
                        failure.get_or_insert(error);
                        tasks.abort_all();
                    }
                    Some(Err(join_error)) if join_error.is_cancelled() => {}
                    Some(Err(join_error)) => {
                        failure.get_or_insert(EngineError::fatal(
                            ErrorKind::Unknown,
                            format!("segment task: {join_error}"),
                        ));
                        tasks.abort_all();
                    }
                }
            }
            _ = cancel.cancelled_wait() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                snapshot_segments(&shared, ctx).await;
                return Ok(Phase::Cancelled);
            }
            _ = tick.tick() => {
                let downloaded = shared.downloaded.load(Ordering::Relaxed);
                let speed = downloaded.saturating_sub(last_downloaded);
                last_downloaded = downloaded;
                ctx.send(WorkerUpdate::Progress {
                    id: ctx.id.clone(),
                    snapshot: ProgressSnapshot {
                        completed: downloaded,
                        total: Some(total),
                        download_speed: speed,
                        upload_speed: 0,
                        connections: params.max_connections as u32,
                        seeders: 0,
                    },
                })
                .await;
                snapshot_segments(&shared, ctx).await;
            }
        }
    }

    snapshot_segments(&shared, ctx).await;
    if let Some(error) = failure {
        return Err(error);
    }
    if shared.validator_changed.load(Ordering::Relaxed) {
        return Ok(Phase::ValidatorChanged);
    }

    let downloaded = shared.downloaded.load(Ordering::Relaxed);
    if downloaded != total {
        return Err(EngineError::fatal(
            ErrorKind::Unknown,
            format!("segment accounting off: {downloaded} of {total} bytes"),
        ));
    }
    // Final progress so the record lands on completed == total.
    ctx.send(WorkerUpdate::Progress {
        id: ctx.id.clone(),
        snapshot: ProgressSnapshot {
            completed: total,
            total: Some(total),
            ..ProgressSnapshot::default()
        },
    })
    .await;
    Ok(Phase::Complete)
}

async fn snapshot_segments(shared: &Arc<SegmentedShared>, ctx: &WorkerContext) {
    let segments = shared
        .segments
        .lock()
        .map(|s| s.clone())
        .unwrap_or_default();
    ctx.send(WorkerUpdate::Segments { id: ctx.id.clone(), segments }).await;
}

struct SegmentJob {
    url: String,
    segment: Segment,
    validator: Option<String>,
    options: RequestOptions,
    retry: HttpConfig,
    client: HttpClient,
    limiters: Arc<LimiterRegistry>,
    shared: Arc<SegmentedShared>,
    ctx: WorkerContext,
}

enum SegmentEnd {
    Complete,
    ValidatorChanged,
    Cancelled,
}

/// Downloads one byte range, retrying transient failures with backoff.
async fn segment_worker(mut job: SegmentJob) -> Result<(), EngineError> {
    let mut attempt = 0u32;
    loop {
        job.set_state(SegmentState::Downloading);
        match stream_segment(&mut job).await {
            Ok(SegmentEnd::Complete) => {
                job.set_state(SegmentState::Completed);
                return Ok(());
            }
            // Validator changed; the supervising loop restarts everything.
            // Cancelled segments are reaped by the supervising loop too.
            Ok(SegmentEnd::ValidatorChanged | SegmentEnd::Cancelled) => return Ok(()),
            Err(error) if error.retryable && attempt < job.retry.max_retries => {
                attempt += 1;
                job.set_state(SegmentState::Failed {
                    retries: attempt,
                    msg: error.message.clone(),
                });
                job.ctx
                    .send(WorkerUpdate::Retrying {
                        id: job.ctx.id.clone(),
                        attempt,
                        max: job.retry.max_retries,
                    })
                    .await;
                let delay = error
                    .retry_after
                    .unwrap_or_else(|| backoff_delay(&job.retry, attempt));
                debug!(
                    index = job.segment.index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "segment retry"
                );
                tokio::time::sleep(delay).await;
                if job.ctx.cancelled() {
                    return Ok(());
                }
            }
            Err(error) => {
                job.set_state(SegmentState::Failed { retries: attempt, msg: error.message.clone() });
                return Err(error);
            }
        }
    }
}

impl SegmentJob {
    fn set_state(&mut self, state: SegmentState) {
        self.segment.state = state.clone();
        if let Ok(mut table) = self.shared.segments.lock()
            && let Some(slot) = table.get_mut(self.segment.index as usize)
        {
            slot.state = state;
            slot.downloaded = self.segment.downloaded;
        }
    }

    fn add_bytes(&mut self, n: u64) {
        self.segment.downloaded += n;
        self.shared.downloaded.fetch_add(n, Ordering::Relaxed);
        if let Ok(mut table) = self.shared.segments.lock()
            && let Some(slot) = table.get_mut(self.segment.index as usize)
        {
            slot.downloaded = self.segment.downloaded;
        }
    }
}

/// Streams one ranged GET into the shared file.
async fn stream_segment(job: &mut SegmentJob) -> Result<SegmentEnd, EngineError> {
    if job.segment.remaining() == 0 {
        return Ok(SegmentEnd::Complete);
    }
    let response = job
        .client
        .get_range(
            &job.url,
            job.segment.write_offset(),
            Some(job.segment.end),
            job.validator.as_deref(),
            &job.options,
        )
        .await?;

    if response.status() == reqwest::StatusCode::OK {
        job.shared.validator_changed.store(true, Ordering::Relaxed);
        return Ok(SegmentEnd::ValidatorChanged);
    }

    let mut offset = job.segment.write_offset();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if job.ctx.cancelled() {
            return Ok(SegmentEnd::Cancelled);
        }
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                EngineError::timeout(format!("segment read: {e}"))
            } else {
                EngineError::network(format!("segment read: {e}"))
            }
        })?;
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len() as u64;
        if job.segment.downloaded + len > job.segment.len() {
            return Err(EngineError::network("server sent more bytes than requested"));
        }

        // Both buckets must admit the chunk before it is written.
        job.limiters.acquire_download(&job.ctx.id, len).await;
        write_at(&job.shared, offset, chunk.to_vec()).await?;
        offset += len;
        job.add_bytes(len);
    }

    if job.segment.remaining() > 0 {
        return Err(EngineError::network(format!(
            "connection closed {} bytes early",
            job.segment.remaining()
        )));
    }
    Ok(SegmentEnd::Complete)
}

/// Positioned write through the single shared file handle.
async fn write_at(shared: &Arc<SegmentedShared>, offset: u64, data: Vec<u8>) -> Result<(), EngineError> {
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            shared
                .file
                .write_all_at(&data, offset)
                .map_err(|e| EngineError::file(&e, "writing segment"))
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0usize;
            while written < data.len() {
                let n = shared
                    .file
                    .seek_write(&data[written..], offset + written as u64)
                    .map_err(|e| EngineError::file(&e, "writing segment"))?;
                written += n;
            }
            Ok(())
        }
    })
    .await
    .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("write task: {e}")))?
}

/// Sequential single-stream mode for servers without range support or a
/// known length.
async fn run_sequential(
    params: &mut HttpTaskParams,
    client: &HttpClient,
    limiters: &Arc<LimiterRegistry>,
    ctx: &mut WorkerContext,
    final_path: &Path,
) -> Result<Phase, EngineError> {
    std::fs::create_dir_all(&params.save_dir)
        .map_err(|e| EngineError::file(&e, format!("creating {}", params.save_dir.display())))?;
    let part = part_path(final_path);

    let mut attempt = 0u32;
    loop {
        if ctx.cancelled() {
            return Ok(Phase::Cancelled);
        }
        match stream_sequential(params, client, limiters, ctx, &part).await {
            Ok(Phase::Cancelled) => return Ok(Phase::Cancelled),
            Ok(phase) => return Ok(phase),
            Err(error) if error.retryable && attempt < params.retry.max_retries => {
                attempt += 1;
                ctx.send(WorkerUpdate::Retrying {
                    id: ctx.id.clone(),
                    attempt,
                    max: params.retry.max_retries,
                })
                .await;
                tokio::time::sleep(backoff_delay(&params.retry, attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn stream_sequential(
    params: &HttpTaskParams,
    client: &HttpClient,
    limiters: &Arc<LimiterRegistry>,
    ctx: &mut WorkerContext,
    part: &Path,
) -> Result<Phase, EngineError> {
    use tokio::io::AsyncWriteExt;

    // No range support means no resume: every attempt restarts the file.
    let response = client.get(&params.url, &params.options).await?;
    let total = params.total.or_else(|| response.content_length());

    let file = tokio::fs::File::create(part)
        .await
        .map_err(|e| EngineError::file(&e, format!("creating {}", part.display())))?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut downloaded = 0u64;
    let mut last_downloaded = 0u64;
    let mut stream = response.bytes_stream();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk.map_err(|e| {
                    if e.is_timeout() {
                        EngineError::timeout(format!("read: {e}"))
                    } else {
                        EngineError::network(format!("read: {e}"))
                    }
                })?;
                let len = chunk.len() as u64;
                limiters.acquire_download(&ctx.id, len).await;
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| EngineError::file(&e, format!("writing {}", part.display())))?;
                downloaded += len;
                if ctx.cancelled() {
                    let _ = writer.flush().await;
                    return Ok(Phase::Cancelled);
                }
            }
            _ = tick.tick() => {
                ctx.send(WorkerUpdate::Progress {
                    id: ctx.id.clone(),
                    snapshot: ProgressSnapshot {
                        completed: downloaded,
                        total,
                        download_speed: downloaded.saturating_sub(last_downloaded),
                        upload_speed: 0,
                        connections: 1,
                        seeders: 0,
                    },
                })
                .await;
                last_downloaded = downloaded;
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| EngineError::file(&e, format!("flushing {}", part.display())))?;

    if let Some(total) = total
        && downloaded != total
    {
        return Err(EngineError::network(format!(
            "connection closed early: {downloaded} of {total} bytes"
        )));
    }
    ctx.send(WorkerUpdate::Progress {
        id: ctx.id.clone(),
        snapshot: ProgressSnapshot {
            completed: downloaded,
            total: Some(downloaded),
            ..ProgressSnapshot::default()
        },
    })
    .await;
    Ok(Phase::Complete)
}

/// Exponential backoff with ±25 % jitter: `base * 2^(attempt-1)`, capped.
fn backoff_delay(cfg: &HttpConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base_ms = cfg.retry_delay_ms.saturating_mul(1u64 << exponent);
    let capped_ms = base_ms.min(cfg.max_retry_delay_ms);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped_ms as f64 * jitter) as u64)
}
