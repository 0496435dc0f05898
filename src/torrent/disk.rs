//! Torrent disk layout: mapping pieces onto files and verified reads/writes.
//!
//! Pieces are assembled in memory, verified, then written here. Reads serve
//! seeding peers. All file I/O runs on the blocking pool; offsets are
//! computed from the metainfo's cumulative file table.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, instrument};

use super::metainfo::{FileEntry, Metainfo, Sha1Hash};
use crate::error::{EngineError, ErrorKind};

/// Extension used for in-progress single-file torrents.
const PART_SUFFIX: &str = ".part";

/// Resolved on-disk layout for one torrent.
#[derive(Debug)]
pub struct TorrentDisk {
    /// Download root; single-file torrents live directly under it.
    root: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u32,
    total_size: u64,
    /// Single-file torrents write to `<name>.part` until completion.
    single_file: bool,
    name: String,
}

impl TorrentDisk {
    /// Lays out the torrent under `save_dir` and creates parent directories.
    ///
    /// # Errors
    ///
    /// Returns `file`/`disk_full` errors if directories cannot be created.
    #[instrument(skip(meta, save_dir), fields(name = %meta.name))]
    pub fn create(meta: &Metainfo, save_dir: &Path) -> Result<Self, EngineError> {
        let single_file = !meta.multi_file;
        let root = if single_file {
            save_dir.to_path_buf()
        } else {
            save_dir.join(&meta.name)
        };

        for entry in &meta.files {
            let target = root.join(&entry.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::file(&e, format!("creating {}", parent.display())))?;
            }
        }

        Ok(Self {
            root,
            files: meta.files.clone(),
            piece_length: meta.piece_length,
            total_size: meta.total_size,
            single_file,
            name: meta.name.clone(),
        })
    }

    /// The paths this torrent writes, relative to the save dir.
    #[must_use]
    pub fn relative_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| {
                if self.single_file {
                    f.path.to_string_lossy().into_owned()
                } else {
                    Path::new(&self.name).join(&f.path).to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    /// Length of the given piece (the last may be short).
    #[must_use]
    pub fn piece_len(&self, index: usize) -> u32 {
        let start = index as u64 * u64::from(self.piece_length);
        self.total_size
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    /// Writes a verified piece at its global offset.
    ///
    /// # Errors
    ///
    /// Surfaces `file`/`disk_full` errors; these are fatal to the session.
    pub async fn write_piece(self: &Arc<Self>, index: usize, data: Vec<u8>) -> Result<(), EngineError> {
        let this = Arc::clone(self);
        let offset = index as u64 * u64::from(this.piece_length);
        tokio::task::spawn_blocking(move || this.write_at(offset, &data))
            .await
            .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("disk task: {e}")))?
    }

    /// Reads an arbitrary span, for serving blocks while seeding.
    ///
    /// # Errors
    ///
    /// Surfaces `file` errors.
    pub async fn read_span(
        self: &Arc<Self>,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, EngineError> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.read_at(offset, length))
            .await
            .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("disk task: {e}")))?
    }

    /// Re-hashes a piece already on disk (startup validation).
    ///
    /// # Errors
    ///
    /// Surfaces `file` errors; a missing file reads as a mismatch.
    pub async fn verify_piece(self: &Arc<Self>, index: usize, expected: Sha1Hash) -> Result<bool, EngineError> {
        let this = Arc::clone(self);
        let offset = index as u64 * u64::from(this.piece_length);
        let length = this.piece_len(index) as usize;
        tokio::task::spawn_blocking(move || match this.read_at(offset, length) {
            Ok(data) => {
                let digest: Sha1Hash = Sha1::digest(&data).into();
                Ok(digest == expected)
            }
            Err(_) => Ok(false),
        })
        .await
        .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("disk task: {e}")))?
    }

    /// Renames `<name>.part` to `<name>` once the torrent completes.
    ///
    /// Multi-file torrents write into their final directory from the start,
    /// so there is nothing to rename.
    ///
    /// # Errors
    ///
    /// Surfaces `file` errors from the rename.
    pub fn finalize(&self) -> Result<(), EngineError> {
        if !self.single_file {
            return Ok(());
        }
        let partial = self.partial_path(&self.files[0]);
        let target = self.root.join(&self.files[0].path);
        if partial.exists() {
            std::fs::rename(&partial, &target)
                .map_err(|e| EngineError::file(&e, format!("renaming {}", partial.display())))?;
            debug!(path = %target.display(), "finalized artifact");
        }
        Ok(())
    }

    /// Removes everything this torrent wrote (for `remove --delete-files`).
    pub fn remove_artifacts(&self) {
        for entry in &self.files {
            let _ = std::fs::remove_file(self.partial_path(entry));
            let _ = std::fs::remove_file(self.root.join(&entry.path));
        }
        if !self.single_file {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn partial_path(&self, entry: &FileEntry) -> PathBuf {
        if self.single_file {
            let mut name = entry.path.as_os_str().to_os_string();
            name.push(PART_SUFFIX);
            self.root.join(name)
        } else {
            self.root.join(&entry.path)
        }
    }

    /// Where this file's bytes live right now: the finalized path once it
    /// exists (resumed seeding), the partial path while downloading.
    fn io_path(&self, entry: &FileEntry) -> PathBuf {
        let finalized = self.root.join(&entry.path);
        if self.single_file && finalized.exists() {
            finalized
        } else {
            self.partial_path(entry)
        }
    }

    /// Files overlapping `[offset, offset + len)`, with in-file ranges.
    fn overlapping(&self, offset: u64, len: u64) -> Vec<(usize, u64, u64)> {
        let end = offset + len;
        let mut spans = Vec::new();
        for (i, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;
            if file_end <= offset || file_start >= end {
                continue;
            }
            let span_start = offset.max(file_start);
            let span_end = end.min(file_end);
            spans.push((i, span_start - file_start, span_end - span_start));
        }
        spans
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let mut consumed = 0usize;
        for (file_index, file_offset, span_len) in self.overlapping(offset, data.len() as u64) {
            let path = self.io_path(&self.files[file_index]);
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| EngineError::file(&e, format!("opening {}", path.display())))?;
            file.seek(SeekFrom::Start(file_offset))
                .map_err(|e| EngineError::file(&e, format!("seeking {}", path.display())))?;
            file.write_all(&data[consumed..consumed + span_len as usize])
                .map_err(|e| EngineError::file(&e, format!("writing {}", path.display())))?;
            consumed += span_len as usize;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, EngineError> {
        let mut out = vec![0u8; length];
        let mut consumed = 0usize;
        for (file_index, file_offset, span_len) in self.overlapping(offset, length as u64) {
            let path = self.io_path(&self.files[file_index]);
            let mut file = std::fs::File::open(&path)
                .map_err(|e| EngineError::file(&e, format!("opening {}", path.display())))?;
            file.seek(SeekFrom::Start(file_offset))
                .map_err(|e| EngineError::file(&e, format!("seeking {}", path.display())))?;
            file.read_exact(&mut out[consumed..consumed + span_len as usize])
                .map_err(|e| EngineError::file(&e, format!("reading {}", path.display())))?;
            consumed += span_len as usize;
        }
        Ok(out)
    }
}

/// Verifies a fully assembled in-memory piece against its metainfo hash.
///
/// Runs on the blocking pool: hashing a multi-megabyte piece is bounded CPU
/// work that must not stall the reactor.
pub async fn verify_block_data(data: Vec<u8>, expected: Sha1Hash) -> (Vec<u8>, bool) {
    tokio::task::spawn_blocking(move || {
        let digest: Sha1Hash = Sha1::digest(&data).into();
        let ok = digest == expected;
        (data, ok)
    })
    .await
    .unwrap_or_else(|_| (Vec::new(), false))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use super::super::bencode::Value;

    fn single_file_meta(length: u64) -> Metainfo {
        let piece_count = (length as usize).div_ceil(16_384).max(1);
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(length as i64));
        info.insert(b"name".to_vec(), Value::from("artifact.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; piece_count * 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&Value::Dict(root).encode()).unwrap()
    }

    fn multi_file_meta() -> Metainfo {
        let mut f1 = BTreeMap::new();
        f1.insert(b"length".to_vec(), Value::Int(10));
        f1.insert(b"path".to_vec(), Value::List(vec![Value::from("a.bin")]));
        let mut f2 = BTreeMap::new();
        f2.insert(b"length".to_vec(), Value::Int(20));
        f2.insert(b"path".to_vec(), Value::List(vec![Value::from("sub"), Value::from("b.bin")]));
        let mut info = BTreeMap::new();
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(f1), Value::Dict(f2)]));
        info.insert(b"name".to_vec(), Value::from("bundle"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        Metainfo::from_bytes(&Value::Dict(root).encode()).unwrap()
    }

    #[tokio::test]
    async fn test_single_file_write_read_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(100);
        let disk = Arc::new(TorrentDisk::create(&meta, dir.path()).unwrap());

        let data: Vec<u8> = (0..100u8).collect();
        disk.write_piece(0, data.clone()).await.unwrap();

        // In progress: only the .part file exists.
        assert!(dir.path().join("artifact.bin.part").exists());
        assert!(!dir.path().join("artifact.bin").exists());

        assert_eq!(disk.read_span(10, 20).await.unwrap(), &data[10..30]);

        disk.finalize().unwrap();
        assert!(dir.path().join("artifact.bin").exists());
        assert!(!dir.path().join("artifact.bin.part").exists());
    }

    #[tokio::test]
    async fn test_multi_file_spans_cross_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let meta = multi_file_meta();
        let disk = Arc::new(TorrentDisk::create(&meta, dir.path()).unwrap());

        // One 30-byte piece covering both files.
        let data: Vec<u8> = (0..30u8).collect();
        disk.write_piece(0, data.clone()).await.unwrap();

        assert!(dir.path().join("bundle/a.bin").exists());
        assert!(dir.path().join("bundle/sub/b.bin").exists());
        assert_eq!(std::fs::read(dir.path().join("bundle/a.bin")).unwrap(), &data[..10]);
        assert_eq!(std::fs::read(dir.path().join("bundle/sub/b.bin")).unwrap(), &data[10..]);

        // Read back across the file boundary.
        assert_eq!(disk.read_span(5, 10).await.unwrap(), &data[5..15]);
    }

    #[tokio::test]
    async fn test_verify_piece_matches_disk_content() {
        let dir = tempfile::tempdir().unwrap();
        let meta = single_file_meta(64);
        let disk = Arc::new(TorrentDisk::create(&meta, dir.path()).unwrap());
        let data = vec![0x5au8; 64];
        let expected: Sha1Hash = Sha1::digest(&data).into();

        // Nothing on disk yet: mismatch.
        assert!(!disk.verify_piece(0, expected).await.unwrap());

        disk.write_piece(0, data).await.unwrap();
        assert!(disk.verify_piece(0, expected).await.unwrap());
        assert!(!disk.verify_piece(0, [0u8; 20]).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_block_data() {
        let data = vec![1u8, 2, 3];
        let expected: Sha1Hash = Sha1::digest(&data).into();
        let (returned, ok) = verify_block_data(data.clone(), expected).await;
        assert!(ok);
        assert_eq!(returned, data);
        let (_, ok) = verify_block_data(data, [0u8; 20]).await;
        assert!(!ok);
    }

    #[test]
    fn test_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let single = TorrentDisk::create(&single_file_meta(10), dir.path()).unwrap();
        assert_eq!(single.relative_paths(), vec!["artifact.bin".to_string()]);

        let multi = TorrentDisk::create(&multi_file_meta(), dir.path()).unwrap();
        assert_eq!(
            multi.relative_paths(),
            vec!["bundle/a.bin".to_string(), "bundle/sub/b.bin".to_string()]
        );
    }

    #[test]
    fn test_remove_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let meta = multi_file_meta();
        let disk = TorrentDisk::create(&meta, dir.path()).unwrap();
        std::fs::write(dir.path().join("bundle/a.bin"), b"x").unwrap();
        disk.remove_artifacts();
        assert!(!dir.path().join("bundle").exists());
    }
}
