//! Magnet URI parsing and composition (BEP 9 address format).

use thiserror::Error;

use super::metainfo::Sha1Hash;

/// Magnet parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MagnetError {
    #[error("not a magnet URI")]
    NotMagnet,

    #[error("missing xt=urn:btih parameter")]
    MissingInfoHash,

    #[error("invalid info hash: {0}")]
    InvalidInfoHash(String),

    #[error("invalid exact length: {0}")]
    InvalidLength(String),
}

/// A parsed magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: Sha1Hash,
    /// `dn` display name.
    pub display_name: Option<String>,
    /// `tr` tracker URLs in appearance order.
    pub trackers: Vec<String>,
    /// `ws` web seed URLs.
    pub web_seeds: Vec<String>,
    /// `xl` exact length in bytes.
    pub exact_length: Option<u64>,
}

impl MagnetLink {
    /// Parses a `magnet:?...` URI.
    ///
    /// The only required parameter is `xt=urn:btih:<40 hex | 32 base32>`.
    ///
    /// # Errors
    ///
    /// Returns [`MagnetError`] when the scheme or info hash is invalid.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or(MagnetError::NotMagnet)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut web_seeds = Vec::new();
        let mut exact_length = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            // "tr.1=" style numbered parameters are treated as their base name.
            let name = match name.split_once('.') {
                Some((base, suffix)) if suffix.bytes().all(|b| b.is_ascii_digit()) => base,
                _ => name,
            };
            let decoded = urlencoding::decode(value)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| value.to_string());

            match name {
                "xt" => {
                    let Some(encoded) = decoded.strip_prefix("urn:btih:") else {
                        continue;
                    };
                    info_hash = Some(decode_btih(encoded)?);
                }
                "dn" => display_name = Some(decoded),
                "tr" => trackers.push(decoded),
                "ws" => web_seeds.push(decoded),
                "xl" => {
                    let parsed = decoded
                        .parse::<u64>()
                        .map_err(|_| MagnetError::InvalidLength(decoded.clone()))?;
                    exact_length = Some(parsed);
                }
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            trackers,
            web_seeds,
            exact_length,
        })
    }

    /// Composes the canonical URI form (hex info hash).
    #[must_use]
    pub fn compose(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", hex::encode(self.info_hash));
        if let Some(name) = &self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(name));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        for seed in &self.web_seeds {
            uri.push_str("&ws=");
            uri.push_str(&urlencoding::encode(seed));
        }
        if let Some(len) = self.exact_length {
            uri.push_str("&xl=");
            uri.push_str(&len.to_string());
        }
        uri
    }

    /// Hex form of the info hash.
    #[must_use]
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn decode_btih(encoded: &str) -> Result<Sha1Hash, MagnetError> {
    let invalid = || MagnetError::InvalidInfoHash(encoded.to_string());
    match encoded.len() {
        40 => {
            let bytes = hex::decode(encoded).map_err(|_| invalid())?;
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        32 => {
            let bytes = base32_decode(encoded.as_bytes()).ok_or_else(invalid)?;
            if bytes.len() != 20 {
                return Err(invalid());
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        _ => Err(invalid()),
    }
}

/// RFC 4648 base32 (no padding), as used by legacy btih encodings.
fn base32_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in input {
        let value = match byte {
            b'A'..=b'Z' => byte - b'A',
            b'a'..=b'z' => byte - b'a',
            b'2'..=b'7' => byte - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | u32::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}
