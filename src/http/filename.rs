//! Output filename resolution and sanitization.

use std::path::{Path, PathBuf};

use url::Url;

/// Fallback when nothing usable can be derived.
const DEFAULT_NAME: &str = "download";

/// Longest filename we will produce.
const MAX_NAME_LEN: usize = 200;

/// Strips path separators, control characters, and surrounding dots or
/// whitespace so a server-supplied name cannot escape the save directory.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    if name.is_empty() || name == "." || name == ".." {
        name = DEFAULT_NAME.to_string();
    }
    name
}

/// Extracts a filename from a `Content-Disposition` header value.
///
/// Supports both the plain `filename="..."` parameter and the RFC 5987
/// `filename*=charset''...` form (which wins when both are present).
#[must_use]
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            // charset''value, percent-encoded.
            let value = value.split_once("''").map(|(_, v)| v).unwrap_or(value);
            if let Ok(decoded) = urlencoding::decode(value) {
                extended = Some(decoded.into_owned());
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            plain = Some(value.trim_matches('"').to_string());
        }
    }
    extended
        .or(plain)
        .map(|name| sanitize_filename(&name))
        .filter(|name| name.as_str() != DEFAULT_NAME || header.contains(DEFAULT_NAME))
}

/// Derives a filename from the final URL path segment.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let decoded = urlencoding::decode(segment)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    sanitize_filename(&decoded)
}

/// Resolves a path under `dir` that does not collide with existing files
/// by appending `_2`, `_3`, ... before the extension.
#[must_use]
pub fn resolve_unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() && !with_part_suffix(&candidate).exists() {
        return candidate;
    }
    let (stem, ext) = split_name(name);
    for n in 2..10_000 {
        let numbered = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(&numbered);
        if !candidate.exists() && !with_part_suffix(&candidate).exists() {
            return candidate;
        }
    }
    dir.join(name)
}

fn with_part_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b/c"), "a_b_c");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename(".."), "download");
        assert_eq!(sanitize_filename("..."), "download");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), 200);
    }

    #[test]
    fn test_content_disposition_plain() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=data.bin"),
            Some("data.bin".to_string())
        );
        assert_eq!(filename_from_content_disposition("inline"), None);
    }

    #[test]
    fn test_content_disposition_extended_form_wins() {
        let header = "attachment; filename=\"fallback.bin\"; filename*=UTF-8''na%C3%AFve%20file.bin";
        assert_eq!(
            filename_from_content_disposition(header),
            Some("naïve file.bin".to_string())
        );
    }

    #[test]
    fn test_filename_from_url() {
        let url = Url::parse("https://example.com/pub/big%20file.iso?mirror=1").unwrap();
        assert_eq!(filename_from_url(&url), "big file.iso");
        let bare = Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&bare), "download");
    }

    #[test]
    fn test_resolve_unique_path_appends_suffix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_unique_path(dir.path(), "a.bin"), dir.path().join("a.bin"));

        std::fs::write(dir.path().join("a.bin"), b"x").unwrap();
        assert_eq!(resolve_unique_path(dir.path(), "a.bin"), dir.path().join("a_2.bin"));

        std::fs::write(dir.path().join("a_2.bin"), b"x").unwrap();
        assert_eq!(resolve_unique_path(dir.path(), "a.bin"), dir.path().join("a_3.bin"));
    }

    #[test]
    fn test_resolve_unique_path_respects_part_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin.part"), b"x").unwrap();
        assert_eq!(resolve_unique_path(dir.path(), "a.bin"), dir.path().join("a_2.bin"));
    }
}
