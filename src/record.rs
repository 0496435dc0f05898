//! Canonical download records and their lifecycle types.
//!
//! The types here are the unit of persistence and the vocabulary of the
//! event stream: everything the controller owns, the storage layer
//! serializes, and the RPC surface reports is expressed in terms of
//! [`DownloadRecord`] and its parts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Sixteen lowercase hexadecimal characters identifying a download.
///
/// Ids are unique within the engine for the lifetime of the record,
/// including across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(String);

impl DownloadId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let raw: u64 = rng.r#gen();
        Self(format!("{raw:016x}"))
    }

    /// Validates and wraps an id received from a client.
    ///
    /// # Errors
    ///
    /// Returns the offending string if it is not 16 lowercase hex chars.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() == 16 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("invalid download id: {s}"))
        }
    }

    /// Borrows the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a download was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Http,
    Torrent,
    Magnet,
}

impl DownloadKind {
    /// Stable string form used in the database and event payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Torrent => "torrent",
            Self::Magnet => "magnet",
        }
    }
}

impl std::str::FromStr for DownloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "torrent" => Ok(Self::Torrent),
            "magnet" => Ok(Self::Magnet),
            _ => Err(format!("invalid download kind: {s}")),
        }
    }
}

/// Queue admission priority. `Critical` is admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank is admitted first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("invalid priority: {s}")),
        }
    }
}

/// Normalized lifecycle of a download.
///
/// Workers never surface third-party status strings; the controller maps
/// every internal outcome onto this enum before it reaches storage or the
/// event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    /// Waiting for an admission slot.
    Queued,
    /// Actively transferring.
    Downloading,
    /// Active but no forward progress for at least 30 s.
    Stalled,
    /// Suspended by the user.
    Paused,
    /// All bytes present and verified.
    Completed,
    /// Terminal failure.
    Error { kind: ErrorKind },
    /// Re-attempting after a transient failure.
    Retrying { attempt: u32, max: u32 },
}

impl DownloadState {
    /// True for `Completed` and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }

    /// True for states that occupy a concurrency slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Stalled | Self::Retrying { .. })
    }

    /// Short label for logs; the full form is the serde representation.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Stalled => "stalled",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error { .. } => "error",
            Self::Retrying { .. } => "retrying",
        }
    }
}

/// State of one HTTP segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Downloading,
    Completed,
    Failed { retries: u32, msg: String },
}

/// A contiguous byte range of an HTTP download owned by one task.
///
/// Segments are ordered by index and partition `[0, total)` without
/// overlap; the sum of `downloaded` equals the record's completed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the partition, starting at zero.
    pub index: u32,
    /// First byte of the range (inclusive).
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
    /// Bytes already written for this range.
    pub downloaded: u64,
    pub state: SegmentState,
}

impl Segment {
    /// Total bytes covered by this segment.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True when the range is degenerate (never produced by the planner).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Bytes still missing.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded)
    }

    /// Absolute file offset where the next write lands.
    #[must_use]
    pub fn write_offset(&self) -> u64 {
        self.start + self.downloaded
    }
}

/// What the engine is downloading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadSource {
    /// Plain HTTP(S) URL.
    Url { url: String },
    /// Magnet URI; metadata fetched from the swarm.
    Magnet { uri: String },
    /// Parsed `.torrent` file: hex info hash plus the raw metainfo blob.
    Torrent { info_hash: String, blob: Vec<u8> },
}

/// Canonical record persisted for every download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub kind: DownloadKind,
    pub state: DownloadState,
    pub source: DownloadSource,
    /// Human name; resolved from headers/metainfo when not user-supplied.
    pub name: String,
    pub save_dir: PathBuf,
    /// Resolved relative file paths (one for HTTP, one or more for torrents).
    pub files: Vec<String>,
    /// Total size in bytes; `None` until HEAD/metadata resolves it.
    pub total: Option<u64>,
    pub completed: u64,
    /// `ETag` captured for resume validation.
    pub etag: Option<String>,
    /// `Last-Modified` captured for resume validation.
    pub last_modified: Option<String>,
    pub supports_range: bool,
    /// Torrent piece length once metadata is known.
    pub piece_length: Option<u32>,
    /// Packed have-bitfield (Msb0) for torrents.
    pub have_bitfield: Option<Vec<u8>>,
    /// Extra request headers sent with every HTTP request.
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// Expected artifact checksum, `alg:hex`.
    pub checksum: Option<String>,
    /// Last error message, if any.
    pub error: Option<String>,
    pub priority: Priority,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl DownloadRecord {
    /// Creates a fresh `Queued` record for the given source.
    #[must_use]
    pub fn new(kind: DownloadKind, source: DownloadSource, name: String, save_dir: PathBuf) -> Self {
        let now = unix_now();
        Self {
            id: DownloadId::generate(),
            kind,
            state: DownloadState::Queued,
            source,
            name,
            save_dir,
            files: Vec::new(),
            total: None,
            completed: 0,
            etag: None,
            last_modified: None,
            supports_range: false,
            piece_length: None,
            have_bitfield: None,
            headers: BTreeMap::new(),
            user_agent: None,
            referrer: None,
            checksum: None,
            error: None,
            priority: Priority::Normal,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Stamps the record as touched now.
    pub fn touch(&mut self) {
        self.updated_at = unix_now();
    }

    /// Marks completion, keeping the `completed == total` invariant.
    pub fn mark_completed(&mut self) {
        if let Some(total) = self.total {
            self.completed = total;
        }
        self.state = DownloadState::Completed;
        self.completed_at = Some(unix_now());
        self.error = None;
        self.touch();
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
