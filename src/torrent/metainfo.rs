//! Torrent metadata
//!
//! The engine hands back [`TorrentMetadata`] once it knows the info dictionary;
//! local `.torrent` files are parsed here directly so they can be added with
//! their metadata already in place.
//!
//! File offsets are positions in the torrent's contiguous piece space, so the
//! piece holding byte `n` of file `f` is `(f.offset + n) / piece_length`.

use chrono::{DateTime, TimeZone, Utc};
use sha1::{Digest, Sha1};
use std::path::Path;

use super::bencode::{self, BencodeValue};
use crate::error::{Result, StreamError};

/// SHA-1 info hash
pub type InfoHash = [u8; 20];

/// Static per-file metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Position in the torrent's file list
    pub index: usize,
    /// Slash separated path relative to the save directory; multi-file
    /// torrents include the torrent name as the first component
    pub name: String,
    pub size: u64,
    /// Byte offset of the first byte within the torrent
    pub offset: u64,
    pub mtime: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// One past the last byte within the torrent
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// What the streaming layer needs to know about a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: Option<InfoHash>,
    pub name: String,
    pub piece_length: u64,
    pub num_pieces: u32,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
    /// Announce URLs in tier order
    pub trackers: Vec<String>,
}

impl TorrentMetadata {
    /// Lay out `files` back to back and derive offsets and piece count
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        piece_length: u64,
        files: impl IntoIterator<Item = (S, u64)>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(StreamError::metadata("piece length must be greater than zero"));
        }
        let mut offset = 0u64;
        let files: Vec<FileEntry> = files
            .into_iter()
            .enumerate()
            .map(|(index, (name, size))| {
                let entry = FileEntry {
                    index,
                    name: name.into(),
                    size,
                    offset,
                    mtime: None,
                };
                offset += size;
                entry
            })
            .collect();
        if files.is_empty() {
            return Err(StreamError::metadata("torrent has no files"));
        }
        let num_pieces = u32::try_from(offset.div_ceil(piece_length))
            .map_err(|_| StreamError::metadata("too many pieces"))?;

        Ok(Self {
            info_hash: None,
            name: name.into(),
            piece_length,
            num_pieces,
            total_size: offset,
            files,
            trackers: Vec::new(),
        })
    }

    /// Parse a `.torrent` file's bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let doc = bencode::decode(data)?;
        let span = doc
            .info_span
            .ok_or_else(|| StreamError::metadata("missing 'info' dictionary"))?;
        let info = doc
            .root
            .get("info")
            .filter(|v| matches!(v, BencodeValue::Dict(_)))
            .ok_or_else(|| StreamError::metadata("'info' must be a dictionary"))?;

        let name = info
            .get("name.utf-8")
            .or_else(|| info.get("name"))
            .and_then(|v| v.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StreamError::metadata("missing 'name'"))?
            .to_string();
        check_component(&name)?;

        let piece_length = info
            .get("piece length")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StreamError::metadata("missing or invalid 'piece length'"))?;

        let hashes = info
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| StreamError::metadata("missing 'pieces'"))?;
        if hashes.len() % 20 != 0 {
            return Err(StreamError::metadata(format!(
                "'pieces' is {} bytes, not a multiple of 20",
                hashes.len()
            )));
        }

        let mut meta = match info.get("files") {
            Some(list) => {
                let entries = parse_file_list(&name, list)?;
                let layout = entries.iter().map(|(n, size, _)| (n.clone(), *size));
                let mut meta = Self::new(name.clone(), piece_length, layout)?;
                for (file, (_, _, mtime)) in meta.files.iter_mut().zip(entries) {
                    file.mtime = mtime;
                }
                meta
            }
            None => {
                let length = info
                    .get("length")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| StreamError::metadata("missing 'length'"))?;
                let mut meta = Self::new(name.clone(), piece_length, [(name.clone(), length)])?;
                meta.files[0].mtime = parse_mtime(info);
                meta
            }
        };

        if meta.num_pieces as usize != hashes.len() / 20 {
            return Err(StreamError::metadata(format!(
                "{} piece hashes for {} bytes in {} byte pieces",
                hashes.len() / 20,
                meta.total_size,
                piece_length
            )));
        }

        meta.info_hash = Some(Sha1::digest(&data[span]).into());
        meta.trackers = parse_trackers(&doc.root);
        Ok(meta)
    }

    /// Read and parse a `.torrent` file from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            StreamError::config("uri", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
    }

    pub fn info_hash_hex(&self) -> Option<String> {
        self.info_hash
            .map(|hash| hash.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    /// Size of `piece`; the last piece may be short
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = piece as u64 * self.piece_length;
        self.total_size
            .saturating_sub(start)
            .min(self.piece_length)
    }

    /// Piece index and offset within it for byte `file_offset` of `file`
    pub fn piece_at(&self, file: &FileEntry, file_offset: u64) -> (u32, u64) {
        let absolute = file.offset + file_offset;
        let piece = (absolute / self.piece_length).min(self.last_piece() as u64) as u32;
        (piece, absolute % self.piece_length)
    }

    /// First and last piece a file touches
    pub fn file_pieces(&self, file: &FileEntry) -> (u32, u32) {
        let (first, _) = self.piece_at(file, 0);
        let (last, _) = self.piece_at(file, file.size.saturating_sub(1));
        (first, last)
    }

    fn last_piece(&self) -> u32 {
        self.num_pieces.saturating_sub(1)
    }
}

/// `(name, size, mtime)` triples for a multi-file torrent
fn parse_file_list(
    root: &str,
    list: &BencodeValue,
) -> Result<Vec<(String, u64, Option<DateTime<Utc>>)>> {
    let list = list
        .as_list()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| StreamError::metadata("'files' must be a non-empty list"))?;

    list.iter()
        .map(|file| {
            let size = file
                .get("length")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| StreamError::metadata("file entry without 'length'"))?;
            let components = file
                .get("path.utf-8")
                .or_else(|| file.get("path"))
                .and_then(|v| v.as_list())
                .filter(|c| !c.is_empty())
                .ok_or_else(|| StreamError::metadata("file entry without 'path'"))?;

            let mut name = root.to_string();
            for component in components {
                let component = component
                    .as_str()
                    .ok_or_else(|| StreamError::metadata("path component is not UTF-8"))?;
                check_component(component)?;
                name.push('/');
                name.push_str(component);
            }
            Ok((name, size, parse_mtime(file)))
        })
        .collect()
}

/// Path components must not be able to climb out of the save directory
fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
    {
        return Err(StreamError::metadata(format!(
            "unsafe path component {:?}",
            component
        )));
    }
    Ok(())
}

fn parse_mtime(dict: &BencodeValue) -> Option<DateTime<Utc>> {
    dict.get("mtime")
        .and_then(|v| v.as_int())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// `announce-list` tiers flattened in order, falling back to `announce`
fn parse_trackers(root: &BencodeValue) -> Vec<String> {
    let mut trackers: Vec<String> = root
        .get("announce-list")
        .and_then(|v| v.as_list())
        .into_iter()
        .flatten()
        .filter_map(|tier| tier.as_list())
        .flatten()
        .filter_map(|url| url.as_str())
        .map(String::from)
        .collect();

    if let Some(announce) = root.get("announce").and_then(|v| v.as_str()) {
        if !trackers.iter().any(|t| t == announce) {
            trackers.insert(0, announce.to_string());
        }
    }
    trackers
}
