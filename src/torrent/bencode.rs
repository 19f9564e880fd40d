//! Bencode decoding for local `.torrent` files
//!
//! Only what the metainfo reader needs: a value tree plus the exact byte span
//! of the top-level `info` dictionary, which is hashed as-is for the info hash.
//!
//! - Integers:   `i<number>e`
//! - Strings:    `<length>:<data>`
//! - Lists:      `l<items>e`
//! - Dicts:      `d<pairs>e`

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::error::{Result, StreamError};

/// Refuse strings larger than this (64 MiB); a `.torrent` never needs more
const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Deeper nesting than this is treated as malformed input
const MAX_DEPTH: usize = 64;

/// A decoded bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    /// Byte string, not necessarily UTF-8
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{}", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 64 => write!(f, "{:?}", s),
                _ => write!(f, "<{} bytes>", b.len()),
            },
            Self::List(l) => f.debug_list().entries(l).finish(),
            Self::Dict(d) => f
                .debug_map()
                .entries(d.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}

/// A fully decoded document
#[derive(Debug)]
pub struct Document {
    pub root: BencodeValue,
    /// Byte range of the top-level `info` value, if present
    pub info_span: Option<Range<usize>>,
}

/// Decode a complete document, rejecting trailing bytes
pub fn decode(data: &[u8]) -> Result<Document> {
    let mut decoder = Decoder {
        data,
        pos: 0,
        info_span: None,
    };
    let root = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(decoder.error(format!(
            "{} trailing bytes after document",
            data.len() - decoder.pos
        )));
    }
    Ok(Document {
        root,
        info_span: decoder.info_span,
    })
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn error(&self, message: impl fmt::Display) -> StreamError {
        StreamError::metadata(format!("bencode at byte {}: {}", self.pos, message))
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        match self.peek()? {
            b'i' => self.integer().map(BencodeValue::Integer),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
            c => Err(self.error(format!("unexpected marker {:?}", c as char))),
        }
    }

    /// Read up to (not including) `terminator` and advance past it
    fn until(&mut self, terminator: u8) -> Result<&'a str> {
        let data = self.data;
        let rest = &data[self.pos..];
        let len = rest
            .iter()
            .position(|&c| c == terminator)
            .ok_or_else(|| self.error(format!("missing {:?}", terminator as char)))?;
        let text = std::str::from_utf8(&rest[..len]).map_err(|_| self.error("non-ASCII number"))?;
        self.pos += len + 1;
        Ok(text)
    }

    fn integer(&mut self) -> Result<i64> {
        self.pos += 1;
        let digits = self.until(b'e')?;
        let unsigned = digits.strip_prefix('-').unwrap_or(digits);
        if unsigned.is_empty()
            || (unsigned.len() > 1 && unsigned.starts_with('0'))
            || digits == "-0"
        {
            return Err(self.error(format!("malformed integer {:?}", digits)));
        }
        digits
            .parse::<i64>()
            .map_err(|_| self.error(format!("integer out of range {:?}", digits)))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len_text = self.until(b':')?;
        let len: usize = len_text
            .parse()
            .map_err(|_| self.error(format!("bad string length {:?}", len_text)))?;
        if len > MAX_STRING_LEN {
            return Err(self.error(format!("string of {} bytes is too large", len)));
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.error(format!("string of {} bytes runs past end", len)))?;
        let data = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(self.error("dictionary key is not a string"));
            }
            let key = self.bytes()?.to_vec();
            let start = self.pos;
            let value = self.value(depth + 1)?;
            if depth == 0 && key == b"info" {
                self.info_span = Some(start..self.pos);
            }
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dict(entries))
    }
}

impl BencodeValue {
    /// Encode back to bytes; dictionary keys come out sorted
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => encode_bytes(b, buf),
            Self::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    encode_bytes(key, buf);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Build a dictionary from string keys
    pub fn dict<'k>(entries: impl IntoIterator<Item = (&'k str, BencodeValue)>) -> Self {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    pub fn string(s: impl AsRef<[u8]>) -> Self {
        Self::Bytes(s.as_ref().to_vec())
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        self.as_int().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for missing keys and non-dictionaries
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}
