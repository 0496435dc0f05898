//! Persistence for download records and HTTP segment state.
//!
//! A single SQLite file holds the catalog. WAL mode is enabled for
//! concurrent reads, segment rows cascade from their download, and all
//! engine writes go through the [`DownloadStore`] trait so higher layers
//! depend on an abstract seam rather than the concrete pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::record::{
    DownloadId, DownloadKind, DownloadRecord, DownloadSource, DownloadState, Priority, Segment,
    SegmentState,
};

/// Maximum connections in the pool. Kept low: SQLite locks at file level.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How long a connection waits before returning `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection or query failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Migration failure at startup.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted value could not be decoded into its domain type.
    #[error("corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Uniform persistence interface the engine programs against.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Inserts or replaces a download record.
    async fn save_download(&self, record: &DownloadRecord) -> Result<(), StorageError>;

    /// Loads one record by id.
    async fn load_download(&self, id: &DownloadId) -> Result<Option<DownloadRecord>, StorageError>;

    /// Loads every record, oldest first.
    async fn load_all(&self) -> Result<Vec<DownloadRecord>, StorageError>;

    /// Deletes a record; segment rows cascade.
    async fn delete_download(&self, id: &DownloadId) -> Result<(), StorageError>;

    /// Replaces the full segment table for a download.
    async fn save_segments(&self, id: &DownloadId, segments: &[Segment])
    -> Result<(), StorageError>;

    /// Loads the segment table for a download, ordered by index.
    async fn load_segments(&self, id: &DownloadId) -> Result<Vec<Segment>, StorageError>;

    /// Reads one settings key.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes one settings key.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Deletes one settings key.
    async fn delete_setting(&self, key: &str) -> Result<(), StorageError>;

    /// Lists all settings keys with their values.
    async fn list_settings(&self) -> Result<Vec<(String, String)>, StorageError>;
}

/// SQLite-backed [`DownloadStore`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Db`] on connection failure or
    /// [`StorageError::Migration`] if migrations fail. Both are fatal to
    /// engine startup.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("database opened");
        Ok(Self { pool })
    }

    /// Creates an in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the connection or migrations fail.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool, for callers that need raw queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes all connections. The instance must not be used afterwards.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Flat row shape for the `downloads` table.
#[derive(Debug, FromRow)]
struct DownloadRow {
    id: String,
    kind: String,
    state: String,
    source: String,
    torrent_blob: Option<Vec<u8>>,
    name: String,
    save_dir: String,
    files: String,
    total: Option<i64>,
    completed: i64,
    etag: Option<String>,
    last_modified: Option<String>,
    supports_range: i64,
    piece_length: Option<i64>,
    have_bitfield: Option<Vec<u8>>,
    headers: String,
    user_agent: Option<String>,
    referrer: Option<String>,
    checksum: Option<String>,
    error: Option<String>,
    priority: String,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl DownloadRow {
    fn into_record(self) -> Result<DownloadRecord, StorageError> {
        let corrupt = |message: String| StorageError::Corrupt {
            id: self.id.clone(),
            message,
        };

        let id = DownloadId::parse(&self.id).map_err(&corrupt)?;
        let kind = DownloadKind::from_str(&self.kind).map_err(&corrupt)?;
        let state: DownloadState =
            serde_json::from_str(&self.state).map_err(|e| corrupt(e.to_string()))?;
        let files: Vec<String> =
            serde_json::from_str(&self.files).map_err(|e| corrupt(e.to_string()))?;
        let headers: BTreeMap<String, String> =
            serde_json::from_str(&self.headers).map_err(|e| corrupt(e.to_string()))?;
        let priority = Priority::from_str(&self.priority).map_err(&corrupt)?;

        let source = match kind {
            DownloadKind::Http => DownloadSource::Url { url: self.source },
            DownloadKind::Magnet => DownloadSource::Magnet { uri: self.source },
            DownloadKind::Torrent => DownloadSource::Torrent {
                info_hash: self.source,
                blob: self.torrent_blob.unwrap_or_default(),
            },
        };

        Ok(DownloadRecord {
            id,
            kind,
            state,
            source,
            name: self.name,
            save_dir: PathBuf::from(self.save_dir),
            files,
            total: self.total.map(|t| t as u64),
            completed: self.completed as u64,
            etag: self.etag,
            last_modified: self.last_modified,
            supports_range: self.supports_range != 0,
            piece_length: self.piece_length.map(|p| p as u32),
            have_bitfield: self.have_bitfield,
            headers,
            user_agent: self.user_agent,
            referrer: self.referrer,
            checksum: self.checksum,
            error: self.error,
            priority,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[async_trait]
impl DownloadStore for Database {
    #[instrument(skip(self, record), fields(id = %record.id, state = record.state.label()))]
    async fn save_download(&self, record: &DownloadRecord) -> Result<(), StorageError> {
        let state = serde_json::to_string(&record.state)
            .map_err(|e| StorageError::Corrupt { id: record.id.to_string(), message: e.to_string() })?;
        let files = serde_json::to_string(&record.files)
            .map_err(|e| StorageError::Corrupt { id: record.id.to_string(), message: e.to_string() })?;
        let headers = serde_json::to_string(&record.headers)
            .map_err(|e| StorageError::Corrupt { id: record.id.to_string(), message: e.to_string() })?;

        let (source, blob): (&str, Option<&[u8]>) = match &record.source {
            DownloadSource::Url { url } => (url, None),
            DownloadSource::Magnet { uri } => (uri, None),
            DownloadSource::Torrent { info_hash, blob } => (info_hash, Some(blob.as_slice())),
        };

        sqlx::query(
            "INSERT INTO downloads (
                id, kind, state, source, torrent_blob, name, save_dir, files,
                total, completed, etag, last_modified, supports_range,
                piece_length, have_bitfield, headers, user_agent, referrer,
                checksum, error, priority, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                state = excluded.state,
                source = excluded.source,
                torrent_blob = excluded.torrent_blob,
                name = excluded.name,
                save_dir = excluded.save_dir,
                files = excluded.files,
                total = excluded.total,
                completed = excluded.completed,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                supports_range = excluded.supports_range,
                piece_length = excluded.piece_length,
                have_bitfield = excluded.have_bitfield,
                headers = excluded.headers,
                user_agent = excluded.user_agent,
                referrer = excluded.referrer,
                checksum = excluded.checksum,
                error = excluded.error,
                priority = excluded.priority,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at",
        )
        .bind(record.id.as_str())
        .bind(record.kind.as_str())
        .bind(&state)
        .bind(source)
        .bind(blob)
        .bind(&record.name)
        .bind(record.save_dir.to_string_lossy().into_owned())
        .bind(&files)
        .bind(record.total.map(|t| t as i64))
        .bind(record.completed as i64)
        .bind(&record.etag)
        .bind(&record.last_modified)
        .bind(i64::from(record.supports_range))
        .bind(record.piece_length.map(i64::from))
        .bind(&record.have_bitfield)
        .bind(&headers)
        .bind(&record.user_agent)
        .bind(&record.referrer)
        .bind(&record.checksum)
        .bind(&record.error)
        .bind(record.priority.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_download(&self, id: &DownloadId) -> Result<Option<DownloadRecord>, StorageError> {
        let row: Option<DownloadRow> =
            sqlx::query_as("SELECT * FROM downloads WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(DownloadRow::into_record).transpose()
    }

    async fn load_all(&self) -> Result<Vec<DownloadRecord>, StorageError> {
        let rows: Vec<DownloadRow> =
            sqlx::query_as("SELECT * FROM downloads ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(DownloadRow::into_record).collect()
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete_download(&self, id: &DownloadId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_segments(
        &self,
        id: &DownloadId,
        segments: &[Segment],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM segments WHERE download_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        for seg in segments {
            let (state, retries, error) = match &seg.state {
                SegmentState::Pending => ("pending", 0_i64, None),
                SegmentState::Downloading => ("downloading", 0, None),
                SegmentState::Completed => ("completed", 0, None),
                SegmentState::Failed { retries, msg } => {
                    ("failed", i64::from(*retries), Some(msg.clone()))
                }
            };
            sqlx::query(
                "INSERT INTO segments
                    (download_id, idx, start_byte, end_byte, downloaded, state, retries, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(id.as_str())
            .bind(i64::from(seg.index))
            .bind(seg.start as i64)
            .bind(seg.end as i64)
            .bind(seg.downloaded as i64)
            .bind(state)
            .bind(retries)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_segments(&self, id: &DownloadId) -> Result<Vec<Segment>, StorageError> {
        let rows = sqlx::query(
            "SELECT idx, start_byte, end_byte, downloaded, state, retries, error
             FROM segments WHERE download_id = ?1 ORDER BY idx",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut segments = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.try_get("state")?;
            let retries: i64 = row.try_get("retries")?;
            let error: Option<String> = row.try_get("error")?;
            let state = match state_str.as_str() {
                "downloading" => SegmentState::Downloading,
                "completed" => SegmentState::Completed,
                "failed" => SegmentState::Failed {
                    retries: retries as u32,
                    msg: error.unwrap_or_default(),
                },
                _ => SegmentState::Pending,
            };
            segments.push(Segment {
                index: row.try_get::<i64, _>("idx")? as u32,
                start: row.try_get::<i64, _>("start_byte")? as u64,
                end: row.try_get::<i64, _>("end_byte")? as u64,
                downloaded: row.try_get::<i64, _>("downloaded")? as u64,
                state,
            });
        }
        Ok(segments)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<(String, String)>, StorageError> {
        let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::DownloadKind;

    fn sample_record() -> DownloadRecord {
        let mut record = DownloadRecord::new(
            DownloadKind::Http,
            DownloadSource::Url { url: "https://example.com/big.iso".into() },
            "big.iso".into(),
            PathBuf::from("/tmp/dl"),
        );
        record.total = Some(10 * 1024 * 1024);
        record.etag = Some("\"v1\"".into());
        record.supports_range = true;
        record.headers.insert("Referer".into(), "https://example.com".into());
        record
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let record = sample_record();
        db.save_download(&record).await.unwrap();

        let loaded = db.load_download(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.kind, DownloadKind::Http);
        assert_eq!(loaded.state, DownloadState::Queued);
        assert_eq!(loaded.total, Some(10 * 1024 * 1024));
        assert_eq!(loaded.etag.as_deref(), Some("\"v1\""));
        assert!(loaded.supports_range);
        assert_eq!(loaded.headers.get("Referer").map(String::as_str), Some("https://example.com"));
        assert_eq!(loaded.save_dir, PathBuf::from("/tmp/dl"));
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let db = Database::open_in_memory().await.unwrap();
        let mut record = sample_record();
        db.save_download(&record).await.unwrap();

        record.completed = 4096;
        record.state = DownloadState::Downloading;
        db.save_download(&record).await.unwrap();

        let loaded = db.load_download(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.completed, 4096);
        assert_eq!(loaded.state, DownloadState::Downloading);
        assert_eq!(db.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torrent_blob_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let mut record = sample_record();
        record.kind = DownloadKind::Torrent;
        record.source = DownloadSource::Torrent {
            info_hash: "aa".repeat(20),
            blob: vec![0x64, 0x65], // "de"
        };
        db.save_download(&record).await.unwrap();

        let loaded = db.load_download(&record.id).await.unwrap().unwrap();
        match loaded.source {
            DownloadSource::Torrent { info_hash, blob } => {
                assert_eq!(info_hash, "aa".repeat(20));
                assert_eq!(blob, vec![0x64, 0x65]);
            }
            other => panic!("wrong source: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_segments_round_trip_and_cascade() {
        let db = Database::open_in_memory().await.unwrap();
        let record = sample_record();
        db.save_download(&record).await.unwrap();

        let segments = vec![
            Segment { index: 0, start: 0, end: 499, downloaded: 500, state: SegmentState::Completed },
            Segment { index: 1, start: 500, end: 999, downloaded: 100, state: SegmentState::Downloading },
            Segment {
                index: 2,
                start: 1000,
                end: 1499,
                downloaded: 0,
                state: SegmentState::Failed { retries: 2, msg: "HTTP 503".into() },
            },
        ];
        db.save_segments(&record.id, &segments).await.unwrap();

        let loaded = db.load_segments(&record.id).await.unwrap();
        assert_eq!(loaded, segments);

        // Deleting the download cascades to its segments.
        db.delete_download(&record.id).await.unwrap();
        assert!(db.load_segments(&record.id).await.unwrap().is_empty());
        assert!(db.load_download(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings_kv() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.get_setting("ua").await.unwrap().is_none());

        db.set_setting("ua", "fetchd/0.1").await.unwrap();
        db.set_setting("close_to_tray", "true").await.unwrap();
        assert_eq!(db.get_setting("ua").await.unwrap().as_deref(), Some("fetchd/0.1"));

        db.set_setting("ua", "other/1").await.unwrap();
        assert_eq!(db.get_setting("ua").await.unwrap().as_deref(), Some("other/1"));

        let all = db.list_settings().await.unwrap();
        assert_eq!(all.len(), 2);

        db.delete_setting("ua").await.unwrap();
        assert!(db.get_setting("ua").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_all_orders_by_creation() {
        let db = Database::open_in_memory().await.unwrap();
        let mut first = sample_record();
        first.created_at = 100;
        let mut second = sample_record();
        second.created_at = 200;
        db.save_download(&second).await.unwrap();
        db.save_download(&first).await.unwrap();

        let all = db.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[1].id, second.id);
    }
}
