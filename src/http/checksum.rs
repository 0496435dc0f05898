//! User-supplied artifact checksums (`alg:hex`).

use std::io::Read;
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, ErrorKind};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
}

/// A parsed `alg:hex` expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: Algorithm,
    /// Lowercase hex digest.
    pub digest: String,
}

impl Checksum {
    /// Parses `sha1:<40 hex>` or `sha256:<64 hex>`.
    ///
    /// # Errors
    ///
    /// Unsupported algorithms (including `md5`) and malformed digests are
    /// rejected as invalid input.
    pub fn parse(spec: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::fatal(ErrorKind::Unknown, format!("invalid checksum: {spec}"));
        let (alg, digest) = spec.split_once(':').ok_or_else(invalid)?;
        let digest = digest.trim().to_ascii_lowercase();
        if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let algorithm = match (alg.trim().to_ascii_lowercase().as_str(), digest.len()) {
            ("sha1" | "sha-1", 40) => Algorithm::Sha1,
            ("sha256" | "sha-256", 64) => Algorithm::Sha256,
            _ => return Err(invalid()),
        };
        Ok(Self { algorithm, digest })
    }

    /// Hashes the artifact and compares. Runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// `hash_mismatch` when the digest differs (the file is kept), `file`
    /// when the artifact cannot be read.
    pub async fn verify_file(&self, path: &Path) -> Result<(), EngineError> {
        let path = path.to_path_buf();
        let expected = self.clone();
        tokio::task::spawn_blocking(move || {
            let actual = hash_file(&path, expected.algorithm)?;
            if actual == expected.digest {
                Ok(())
            } else {
                Err(EngineError::hash_mismatch(format!(
                    "checksum mismatch for {}: expected {}, got {actual}",
                    path.display(),
                    expected.digest
                )))
            }
        })
        .await
        .map_err(|e| EngineError::fatal(ErrorKind::Unknown, format!("checksum task: {e}")))?
    }
}

fn hash_file(path: &Path, algorithm: Algorithm) -> Result<String, EngineError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| EngineError::file(&e, format!("opening {}", path.display())))?;
    let mut buf = vec![0u8; 128 * 1024];

    match algorithm {
        Algorithm::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| EngineError::file(&e, format!("reading {}", path.display())))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        Algorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| EngineError::file(&e, format!("reading {}", path.display())))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_sha1_and_sha256() {
        let sha1 = Checksum::parse(&format!("sha1:{}", "ab".repeat(20))).unwrap();
        assert_eq!(sha1.algorithm, Algorithm::Sha1);
        let sha256 = Checksum::parse(&format!("SHA-256:{}", "CD".repeat(32))).unwrap();
        assert_eq!(sha256.algorithm, Algorithm::Sha256);
        assert_eq!(sha256.digest, "cd".repeat(32));
    }

    #[test]
    fn test_parse_rejects_md5_and_garbage() {
        assert!(Checksum::parse(&format!("md5:{}", "ab".repeat(16))).is_err());
        assert!(Checksum::parse("sha1:short").is_err());
        assert!(Checksum::parse(&format!("sha1:{}", "zz".repeat(20))).is_err());
        assert!(Checksum::parse("nodigest").is_err());
    }

    #[tokio::test]
    async fn test_verify_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let digest = hex::encode(Sha256::digest(b"hello world"));
        let checksum = Checksum::parse(&format!("sha256:{digest}")).unwrap();
        checksum.verify_file(&path).await.unwrap();

        let wrong = Checksum::parse(&format!("sha256:{}", "00".repeat(32))).unwrap();
        let err = wrong.verify_file(&path).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HashMismatch);
        // The artifact is untouched on mismatch.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_verify_file_sha1() {
        use sha1::Digest as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abc").unwrap();
        let digest = hex::encode(Sha1::digest(b"abc"));
        let checksum = Checksum::parse(&format!("sha1:{digest}")).unwrap();
        checksum.verify_file(&path).await.unwrap();
    }
}
