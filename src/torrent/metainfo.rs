//! Torrent metainfo extraction.
//!
//! Parses a `.torrent` blob (or a bare `info` dictionary acquired over
//! BEP 9) into the piece table and file layout the session needs, and
//! computes the info hash over the raw `info` dictionary bytes.

use std::path::PathBuf;

use sha1::{Digest, Sha1};
use thiserror::Error;

use super::bencode::{self, BencodeError, Value};

/// A SHA-1 digest, 20 bytes.
pub type Sha1Hash = [u8; 20];

/// Metainfo parse errors.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing or invalid field: {0}")]
    InvalidField(&'static str),

    #[error("unsafe path component {0:?}")]
    UnsafePath(String),

    #[error("pieces blob length {0} is not a multiple of 20")]
    BadPiecesLength(usize),

    #[error("torrent has no files")]
    Empty,
}

/// One file in the torrent, with its cumulative byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root, already validated.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated torrent data.
    pub offset: u64,
}

/// Parsed torrent metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: Sha1Hash,
    pub name: String,
    pub piece_length: u32,
    /// Per-piece SHA-1 hashes from the `pieces` blob.
    pub pieces: Vec<Sha1Hash>,
    /// File layout; a single entry for single-file torrents.
    pub files: Vec<FileEntry>,
    pub total_size: u64,
    /// True when the torrent contains a top-level `files` list.
    pub multi_file: bool,
    /// Tracker tiers in BEP 12 order; falls back to `announce`.
    pub trackers: Vec<Vec<String>>,
    pub private: bool,
}

impl Metainfo {
    /// Parses a complete `.torrent` blob.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError`] for malformed bencode, missing fields,
    /// inconsistent piece tables, or unsafe path components.
    pub fn from_bytes(blob: &[u8]) -> Result<Self, MetainfoError> {
        let root = Value::decode(blob)?;
        let raw_info = bencode::raw_dict_value(blob, b"info")?
            .ok_or(MetainfoError::InvalidField("info"))?;
        let info = root.get(b"info").ok_or(MetainfoError::InvalidField("info"))?;

        let mut parsed = Self::from_info_dict_value(info, info_hash(raw_info))?;
        parsed.trackers = tracker_tiers(&root);
        Ok(parsed)
    }

    /// Parses a bare `info` dictionary (the BEP 9 metadata payload).
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError`] as for [`from_bytes`](Self::from_bytes).
    pub fn from_info_dict(info_bytes: &[u8]) -> Result<Self, MetainfoError> {
        let info = Value::decode(info_bytes)?;
        Self::from_info_dict_value(&info, info_hash(info_bytes))
    }

    fn from_info_dict_value(info: &Value, info_hash: Sha1Hash) -> Result<Self, MetainfoError> {
        let name = info
            .get_str(b"name")
            .ok_or(MetainfoError::InvalidField("info.name"))?
            .to_string();
        validate_component(&name)?;

        let piece_length = info
            .get_int(b"piece length")
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::InvalidField("info.piece length"))?
            as u32;

        let pieces_blob = info
            .get_bytes(b"pieces")
            .ok_or(MetainfoError::InvalidField("info.pieces"))?;
        if pieces_blob.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength(pieces_blob.len()));
        }
        let pieces: Vec<Sha1Hash> = pieces_blob
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, multi_file) = match info.get_list(b"files") {
            Some(list) => (parse_file_list(list)?, true),
            None => {
                let length = info
                    .get_int(b"length")
                    .filter(|&n| n >= 0)
                    .ok_or(MetainfoError::InvalidField("info.length"))?
                    as u64;
                (
                    vec![FileEntry { path: PathBuf::from(&name), length, offset: 0 }],
                    false,
                )
            }
        };
        if files.is_empty() {
            return Err(MetainfoError::Empty);
        }

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_size.div_ceil(u64::from(piece_length)).max(1);
        if pieces.len() as u64 != expected_pieces {
            return Err(MetainfoError::InvalidField("info.pieces"));
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            pieces,
            files,
            total_size,
            multi_file,
            trackers: Vec::new(),
            private: info.get_int(b"private") == Some(1),
        })
    }

    /// Number of pieces.
    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of a piece; the last one may be short.
    #[must_use]
    pub fn piece_len(&self, index: usize) -> u32 {
        let start = index as u64 * u64::from(self.piece_length);
        let remaining = self.total_size.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Hex form of the info hash.
    #[must_use]
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// SHA-1 over the raw bencoded `info` dictionary.
#[must_use]
pub fn info_hash(raw_info: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(raw_info);
    digest.into()
}

fn parse_file_list(list: &[Value]) -> Result<Vec<FileEntry>, MetainfoError> {
    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;
    for entry in list {
        let length = entry
            .get_int(b"length")
            .filter(|&n| n >= 0)
            .ok_or(MetainfoError::InvalidField("files[].length"))? as u64;
        let components = entry
            .get_list(b"path")
            .ok_or(MetainfoError::InvalidField("files[].path"))?;
        if components.is_empty() {
            return Err(MetainfoError::InvalidField("files[].path"));
        }

        let mut path = PathBuf::new();
        for component in components {
            let component = component
                .as_str()
                .ok_or(MetainfoError::InvalidField("files[].path"))?;
            validate_component(component)?;
            path.push(component);
        }

        files.push(FileEntry { path, length, offset });
        offset += length;
    }
    Ok(files)
}

/// Rejects path components that could escape the save directory.
fn validate_component(component: &str) -> Result<(), MetainfoError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(MetainfoError::UnsafePath(component.to_string()));
    }
    Ok(())
}

fn tracker_tiers(root: &Value) -> Vec<Vec<String>> {
    // BEP 12: announce-list is a list of tiers, each a list of URLs.
    if let Some(tiers) = root.get_list(b"announce-list") {
        let parsed: Vec<Vec<String>> = tiers
            .iter()
            .filter_map(|tier| {
                let urls: Vec<String> = tier
                    .as_list()?
                    .iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect();
                (!urls.is_empty()).then_some(urls)
            })
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    root.get_str(b"announce")
        .map(|announce| vec![vec![announce.to_string()]])
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bval(s: &str) -> Value {
        Value::from(s)
    }

    fn build_single_file_torrent(name: &str, length: u64, piece_length: i64) -> Vec<u8> {
        let piece_count = (length as usize).div_ceil(piece_length as usize).max(1);
        let pieces = vec![0xabu8; piece_count * 20];
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(length as i64));
        info.insert(b"name".to_vec(), bval(name));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), bval("http://tracker.example/announce"));
        root.insert(b"info".to_vec(), Value::Dict(info));
        Value::Dict(root).encode()
    }

    #[test]
    fn test_single_file_parse() {
        let blob = build_single_file_torrent("file.bin", 40_000, 16_384);
        let meta = Metainfo::from_bytes(&blob).unwrap();
        assert_eq!(meta.name, "file.bin");
        assert_eq!(meta.piece_length, 16_384);
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.total_size, 40_000);
        assert!(!meta.multi_file);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, PathBuf::from("file.bin"));
        assert_eq!(meta.trackers, vec![vec!["http://tracker.example/announce".to_string()]]);
    }

    #[test]
    fn test_last_piece_is_short() {
        let blob = build_single_file_torrent("file.bin", 40_000, 16_384);
        let meta = Metainfo::from_bytes(&blob).unwrap();
        assert_eq!(meta.piece_len(0), 16_384);
        assert_eq!(meta.piece_len(1), 16_384);
        assert_eq!(meta.piece_len(2), 40_000 - 2 * 16_384);
    }

    #[test]
    fn test_info_hash_matches_reencoded_info_dict() {
        let blob = build_single_file_torrent("file.bin", 1000, 16_384);
        let meta = Metainfo::from_bytes(&blob).unwrap();

        // Hash of the raw span equals hash of the canonical re-encode.
        let raw = bencode::raw_dict_value(&blob, b"info").unwrap().unwrap();
        let reencoded = Value::decode(raw).unwrap().encode();
        assert_eq!(meta.info_hash, info_hash(&reencoded));
        assert_eq!(meta.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_bare_info_dict_round_trip() {
        let blob = build_single_file_torrent("file.bin", 1000, 16_384);
        let raw = bencode::raw_dict_value(&blob, b"info").unwrap().unwrap();
        let from_info = Metainfo::from_info_dict(raw).unwrap();
        let from_blob = Metainfo::from_bytes(&blob).unwrap();
        assert_eq!(from_info.info_hash, from_blob.info_hash);
        assert_eq!(from_info.name, from_blob.name);
    }

    fn multi_file_blob(paths: Vec<Vec<&str>>, lengths: Vec<i64>) -> Vec<u8> {
        let total: i64 = lengths.iter().sum();
        let piece_count = (total as usize).div_ceil(16_384).max(1);
        let files: Vec<Value> = paths
            .iter()
            .zip(&lengths)
            .map(|(components, &len)| {
                let mut entry = BTreeMap::new();
                entry.insert(b"length".to_vec(), Value::Int(len));
                entry.insert(
                    b"path".to_vec(),
                    Value::List(components.iter().map(|c| bval(c)).collect()),
                );
                Value::Dict(entry)
            })
            .collect();
        let mut info = BTreeMap::new();
        info.insert(b"files".to_vec(), Value::List(files));
        info.insert(b"name".to_vec(), bval("album"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; piece_count * 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        Value::Dict(root).encode()
    }

    #[test]
    fn test_multi_file_cumulative_offsets() {
        let blob = multi_file_blob(
            vec![vec!["cd1", "track1.flac"], vec!["cd1", "track2.flac"], vec!["cover.jpg"]],
            vec![30_000, 20_000, 5_000],
        );
        let meta = Metainfo::from_bytes(&blob).unwrap();
        assert!(meta.multi_file);
        assert_eq!(meta.total_size, 55_000);
        assert_eq!(meta.files[0].offset, 0);
        assert_eq!(meta.files[1].offset, 30_000);
        assert_eq!(meta.files[2].offset, 50_000);
        assert_eq!(meta.files[0].path, PathBuf::from("cd1/track1.flac"));
    }

    #[test]
    fn test_rejects_traversal_components() {
        for bad in [vec![vec![".."]], vec![vec!["ok", "."]], vec![vec![""]], vec![vec!["a/b"]]] {
            let blob = multi_file_blob(bad, vec![100]);
            assert!(
                matches!(Metainfo::from_bytes(&blob), Err(MetainfoError::UnsafePath(_))),
                "expected UnsafePath"
            );
        }
    }

    #[test]
    fn test_rejects_bad_pieces_blob() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(100));
        info.insert(b"name".to_vec(), bval("x"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 19]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        let blob = Value::Dict(root).encode();
        assert!(matches!(
            Metainfo::from_bytes(&blob),
            Err(MetainfoError::BadPiecesLength(19))
        ));
    }

    #[test]
    fn test_piece_count_must_match_total_size() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(100_000));
        info.insert(b"name".to_vec(), bval("x"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        // 100_000 bytes needs 7 pieces; provide 2.
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 2 * 20]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        let blob = Value::Dict(root).encode();
        assert!(Metainfo::from_bytes(&blob).is_err());
    }

    #[test]
    fn test_announce_list_tiers_preferred_over_announce() {
        let mut blob_root = Value::decode(&build_single_file_torrent("f", 100, 16_384)).unwrap();
        if let Value::Dict(map) = &mut blob_root {
            map.insert(
                b"announce-list".to_vec(),
                Value::List(vec![
                    Value::List(vec![bval("udp://t1/ann"), bval("udp://t2/ann")]),
                    Value::List(vec![bval("http://backup/ann")]),
                ]),
            );
        }
        let meta = Metainfo::from_bytes(&blob_root.encode()).unwrap();
        assert_eq!(
            meta.trackers,
            vec![
                vec!["udp://t1/ann".to_string(), "udp://t2/ann".to_string()],
                vec!["http://backup/ann".to_string()],
            ]
        );
    }
}
