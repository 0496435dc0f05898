//! Engine-wide error taxonomy.
//!
//! Every failure surfaced by the engine is keyed by a closed [`ErrorKind`]
//! and carries a `retryable` flag so callers (controller, RPC clients) can
//! decide between backoff and immediate surfacing without string matching.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification of engine failures.
///
/// The set is part of the RPC contract: application error codes are derived
/// from the discriminant, so variants must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// DNS, connect, reset, TLS and other transport-level failures.
    Network,
    /// Local filesystem failure (open, write, rename).
    File,
    /// The remote resource does not exist (404, 410, unknown id).
    NotFound,
    /// A request or peer exceeded its time budget.
    Timeout,
    /// The server demands credentials we do not have (401, 403, 407).
    AuthRequired,
    /// A download for the same source already exists in the catalog.
    AlreadyExists,
    /// The server rejected a range request needed to resume.
    ResumeNotSupported,
    /// A checksum or piece hash did not match its expected value.
    HashMismatch,
    /// A tracker returned a failure reason or malformed response.
    Tracker,
    /// A peer violated the wire protocol.
    PeerProtocol,
    /// Bencode input was malformed.
    BencodeParse,
    /// The filesystem reported no space left.
    DiskFull,
    /// A torrent path component tried to escape the save directory.
    PathTraversal,
    /// Anything that does not fit the taxonomy.
    Unknown,
}

impl ErrorKind {
    /// Stable string form used in persisted state and event payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::File => "file",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::AuthRequired => "auth_required",
            Self::AlreadyExists => "already_exists",
            Self::ResumeNotSupported => "resume_not_supported",
            Self::HashMismatch => "hash_mismatch",
            Self::Tracker => "tracker",
            Self::PeerProtocol => "peer_protocol",
            Self::BencodeParse => "bencode_parse",
            Self::DiskFull => "disk_full",
            Self::PathTraversal => "path_traversal",
            Self::Unknown => "unknown",
        }
    }

    /// JSON-RPC application error code for this kind (−32000..−32099).
    #[must_use]
    pub fn rpc_code(self) -> i64 {
        -32000 - i64::from(self.offset())
    }

    fn offset(self) -> u8 {
        match self {
            Self::Network => 0,
            Self::File => 1,
            Self::NotFound => 2,
            Self::Timeout => 3,
            Self::AuthRequired => 4,
            Self::AlreadyExists => 5,
            Self::ResumeNotSupported => 6,
            Self::HashMismatch => 7,
            Self::Tracker => 8,
            Self::PeerProtocol => 9,
            Self::BencodeParse => 10,
            Self::DiskFull => 11,
            Self::PathTraversal => 12,
            Self::Unknown => 13,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Self::Network),
            "file" => Ok(Self::File),
            "not_found" => Ok(Self::NotFound),
            "timeout" => Ok(Self::Timeout),
            "auth_required" => Ok(Self::AuthRequired),
            "already_exists" => Ok(Self::AlreadyExists),
            "resume_not_supported" => Ok(Self::ResumeNotSupported),
            "hash_mismatch" => Ok(Self::HashMismatch),
            "tracker" => Ok(Self::Tracker),
            "peer_protocol" => Ok(Self::PeerProtocol),
            "bencode_parse" => Ok(Self::BencodeParse),
            "disk_full" => Ok(Self::DiskFull),
            "path_traversal" => Ok(Self::PathTraversal),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

/// A classified engine failure: kind, retryability, human message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    /// Closed classification of the failure.
    pub kind: ErrorKind,
    /// Whether retrying with backoff may succeed.
    pub retryable: bool,
    /// Human-readable description for logs and events.
    pub message: String,
    /// Server-mandated retry delay (`Retry-After`), when one was given.
    pub retry_after: Option<std::time::Duration>,
}

impl EngineError {
    /// Creates an error with explicit retryability.
    pub fn new(kind: ErrorKind, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a server-mandated retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, delay: std::time::Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// A retryable network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, true, message)
    }

    /// A retryable timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, true, message)
    }

    /// A non-retryable missing-resource failure.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, false, message)
    }

    /// A filesystem failure. Retryable unless the disk is full.
    pub fn file(source: &std::io::Error, context: impl fmt::Display) -> Self {
        if is_disk_full(source) {
            Self::new(ErrorKind::DiskFull, false, format!("{context}: {source}"))
        } else {
            Self::new(ErrorKind::File, true, format!("{context}: {source}"))
        }
    }

    /// A non-retryable hash or checksum mismatch.
    pub fn hash_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HashMismatch, false, message)
    }

    /// A non-retryable input or protocol failure of the given kind.
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, false, message)
    }
}

/// Returns true for `ENOSPC`-style write failures.
fn is_disk_full(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(28) {
            return true;
        }
    }
    matches!(err.kind(), std::io::ErrorKind::StorageFull)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_str_round_trip() {
        let kinds = [
            ErrorKind::Network,
            ErrorKind::File,
            ErrorKind::NotFound,
            ErrorKind::Timeout,
            ErrorKind::AuthRequired,
            ErrorKind::AlreadyExists,
            ErrorKind::ResumeNotSupported,
            ErrorKind::HashMismatch,
            ErrorKind::Tracker,
            ErrorKind::PeerProtocol,
            ErrorKind::BencodeParse,
            ErrorKind::DiskFull,
            ErrorKind::PathTraversal,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            let parsed: ErrorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_rpc_codes_stay_in_application_range() {
        assert_eq!(ErrorKind::Network.rpc_code(), -32000);
        assert_eq!(ErrorKind::Unknown.rpc_code(), -32013);
        for kind in [ErrorKind::Tracker, ErrorKind::DiskFull, ErrorKind::Unknown] {
            let code = kind.rpc_code();
            assert!((-32099..=-32000).contains(&code), "code out of range: {code}");
        }
    }

    #[test]
    fn test_engine_error_display_includes_kind_and_message() {
        let err = EngineError::not_found("no such download");
        let msg = err.to_string();
        assert!(msg.contains("not_found"), "missing kind in: {msg}");
        assert!(msg.contains("no such download"), "missing message in: {msg}");
        assert!(!err.retryable);
    }

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(EngineError::network("connection reset").retryable);
        assert!(EngineError::timeout("read timed out").retryable);
        assert!(!EngineError::hash_mismatch("piece 3").retryable);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResumeNotSupported).unwrap();
        assert_eq!(json, "\"resume_not_supported\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::ResumeNotSupported);
    }
}
