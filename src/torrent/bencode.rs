//! Strict Bencode (BEP 3) parsing and canonical encoding.
//!
//! Byte strings are byte-safe (never assumed UTF-8). The parser rejects
//! integers with leading zeros, negative zero, duplicate dictionary keys,
//! and trailing input after the top-level value. Out-of-order dictionary
//! keys are accepted at decode time; they are handled on the encode side
//! instead: keys are always emitted sorted by raw bytes, so
//! `encode(parse(b)) == b` holds exactly for canonical inputs, and a
//! non-canonical input is normalized (and therefore does not round-trip
//! byte-identically).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Nesting depth guard against adversarial inputs.
const MAX_DEPTH: usize = 64;

/// Bencode parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("unexpected byte {byte:#04x} at {pos}")]
    UnexpectedByte { byte: u8, pos: usize },

    #[error("invalid integer at byte {0}")]
    InvalidInt(usize),

    #[error("integer with leading zero at byte {0}")]
    LeadingZero(usize),

    #[error("negative zero at byte {0}")]
    NegativeZero(usize),

    #[error("string length overflows input at byte {0}")]
    LengthOverflow(usize),

    #[error("duplicate dictionary key at byte {0}")]
    DuplicateKey(usize),

    #[error("dictionary key is not a string at byte {0}")]
    NonStringKey(usize),

    #[error("trailing bytes after value at byte {0}")]
    TrailingData(usize),

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
}

/// An owned Bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Parses exactly one value; trailing bytes are an error.
    pub fn decode(input: &[u8]) -> Result<Self, BencodeError> {
        let mut parser = Parser { input, pos: 0 };
        let value = parser.parse_value(0)?;
        if parser.pos != input.len() {
            return Err(BencodeError::TrailingData(parser.pos));
        }
        Ok(value)
    }

    /// Canonical encoding: dict keys sorted by raw bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dictionary lookup by key bytes.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Dictionary lookup yielding an integer.
    #[must_use]
    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    /// Dictionary lookup yielding a UTF-8 string.
    #[must_use]
    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Dictionary lookup yielding raw bytes.
    #[must_use]
    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    /// Dictionary lookup yielding a list.
    #[must_use]
    pub fn get_list(&self, key: &[u8]) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?.to_vec())),
            byte => Err(BencodeError::UnexpectedByte { byte, pos: self.pos }),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        self.bump()?; // 'i'
        let negative = if self.peek()? == b'-' {
            self.bump()?;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        while self.peek()? != b'e' {
            let byte = self.bump()?;
            if !byte.is_ascii_digit() {
                return Err(BencodeError::InvalidInt(start));
            }
        }
        let digits = &self.input[digits_start..self.pos];
        self.bump()?; // 'e'

        if digits.is_empty() {
            return Err(BencodeError::InvalidInt(start));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::LeadingZero(start));
        }
        if negative && digits == b"0" {
            return Err(BencodeError::NegativeZero(start));
        }

        let mut magnitude: i64 = 0;
        for &d in digits {
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add(i64::from(d - b'0')))
                .ok_or(BencodeError::InvalidInt(start))?;
        }
        Ok(Value::Int(if negative { -magnitude } else { magnitude }))
    }

    fn parse_bytes(&mut self) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        let mut digits = 0usize;
        while self.peek()? != b':' {
            let byte = self.bump()?;
            if !byte.is_ascii_digit() {
                return Err(BencodeError::UnexpectedByte { byte, pos: self.pos - 1 });
            }
            // "0:" is the empty string, but "01:x" pads with a leading zero.
            if digits > 0 && len == 0 {
                return Err(BencodeError::LeadingZero(start));
            }
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(byte - b'0')))
                .ok_or(BencodeError::LengthOverflow(start))?;
            digits += 1;
        }
        if digits == 0 {
            return Err(BencodeError::InvalidInt(start));
        }
        self.bump()?; // ':'

        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.input.len())
            .ok_or(BencodeError::LengthOverflow(start))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value(depth + 1)?);
        }
        self.bump()?; // 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey(key_pos));
            }
            let key = self.parse_bytes()?.to_vec();
            let value = self.parse_value(depth + 1)?;
            if map.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey(key_pos));
            }
        }
        self.bump()?; // 'e'
        Ok(Value::Dict(map))
    }
}

/// Returns the raw byte span of one top-level dictionary entry's value.
///
/// Used to hash the `info` dictionary exactly as it appeared on the wire,
/// which is the canonical identity of a torrent.
pub fn raw_dict_value<'a>(input: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut parser = Parser { input, pos: 0 };
    if parser.bump()? != b'd' {
        return Err(BencodeError::UnexpectedByte { byte: input[0], pos: 0 });
    }
    while parser.peek()? != b'e' {
        let entry_key = parser.parse_bytes()?.to_vec();
        let value_start = parser.pos;
        parser.skip_value(0)?;
        if entry_key == key {
            return Ok(Some(&input[value_start..parser.pos]));
        }
    }
    Ok(None)
}

impl Parser<'_> {
    fn skip_value(&mut self, depth: usize) -> Result<(), BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => {
                self.parse_int()?;
            }
            b'0'..=b'9' => {
                self.parse_bytes()?;
            }
            b'l' => {
                self.bump()?;
                while self.peek()? != b'e' {
                    self.skip_value(depth + 1)?;
                }
                self.bump()?;
            }
            b'd' => {
                self.bump()?;
                while self.peek()? != b'e' {
                    self.parse_bytes()?;
                    self.skip_value(depth + 1)?;
                }
                self.bump()?;
            }
            byte => return Err(BencodeError::UnexpectedByte { byte, pos: self.pos }),
        }
        Ok(())
    }
}
