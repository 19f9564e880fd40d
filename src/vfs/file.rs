use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use super::{FileInfo, TorrentFs};
use crate::error::{Result, StorageErrorKind, StreamError};
use crate::scheduler::Registration;
use crate::torrent::{FileEntry, TorrentMetadata};

/// An open handle on one torrent file.
///
/// Reads block until the pieces they cover are downloaded. Once the handle is
/// closed, here or through a [`FileCloser`], every read returns 0 (end of
/// stream). Dropping the handle closes it.
pub struct VirtualFile {
    fs: Arc<TorrentFs>,
    meta: Arc<TorrentMetadata>,
    info: FileInfo,
    seq: u64,
    closed: CancellationToken,
    first_piece: u32,
    last_piece: u32,
    position: u64,
    disk: Option<File>,
}

/// Closes a [`VirtualFile`] from another task
#[derive(Clone)]
pub struct FileCloser {
    fs: Arc<TorrentFs>,
    meta: Arc<TorrentMetadata>,
    seq: u64,
}

impl FileCloser {
    /// Close the handle; false if it was already closed
    pub fn close(&self) -> bool {
        self.fs.close_reader(&self.meta, self.seq)
    }
}

impl VirtualFile {
    pub(super) fn new(
        fs: Arc<TorrentFs>,
        meta: Arc<TorrentMetadata>,
        info: FileInfo,
        registration: Registration,
    ) -> Self {
        let (first_piece, last_piece) = meta.file_pieces(&info.entry);
        Self {
            fs,
            meta,
            info,
            seq: registration.seq,
            closed: registration.closed,
            first_piece,
            last_piece,
            position: 0,
            disk: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.entry.name
    }

    pub fn index(&self) -> usize {
        self.info.entry.index
    }

    pub fn size(&self) -> u64 {
        self.info.entry.size
    }

    /// Offset of the first byte within the torrent
    pub fn offset(&self) -> u64 {
        self.info.entry.offset
    }

    pub fn entry(&self) -> &FileEntry {
        &self.info.entry
    }

    pub fn save_path(&self) -> &Path {
        &self.info.save_path
    }

    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        self.info.entry.mtime
    }

    /// Sequence number used in log lines
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn piece_length(&self) -> u64 {
        self.meta.piece_length
    }

    /// First and last piece of this file
    pub fn pieces(&self) -> (u32, u32) {
        (self.first_piece, self.last_piece)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn downloaded(&self) -> u64 {
        self.fs.downloaded(self.index())
    }

    pub fn progress(&self) -> f32 {
        FileInfo {
            downloaded: self.downloaded(),
            ..self.info.clone()
        }
        .progress()
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded() == self.size()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closer(&self) -> FileCloser {
        FileCloser {
            fs: self.fs.clone(),
            meta: self.meta.clone(),
            seq: self.seq,
        }
    }

    /// Close the handle and release its file priority
    pub fn close(&mut self) {
        if self.fs.close_reader(&self.meta, self.seq) {
            tracing::debug!(seq = self.seq, file = %self.info.entry.name, "Closing file");
        }
        self.disk = None;
    }

    /// Move the cursor; `End` is relative to the full file size
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            StreamError::storage(
                StorageErrorKind::Io,
                &self.info.save_path,
                format!("invalid seek to {:?}", pos),
            )
        })?;
        self.position = target;
        tracing::debug!(seq = self.seq, position = target, size = self.size(), "Seeking");
        Ok(target)
    }

    /// Read at most one piece worth of bytes at the cursor.
    ///
    /// Waits for every piece the read covers. Returns 0 at end of file or once
    /// the handle is closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() || self.position >= self.size() {
            return Ok(0);
        }
        let to_read = (buf.len() as u64)
            .min(self.meta.piece_length)
            .min(self.size() - self.position) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let (start_piece, _) = self.meta.piece_at(&self.info.entry, self.position);
        let (end_piece, _) = self
            .meta
            .piece_at(&self.info.entry, self.position + to_read as u64 - 1);

        for piece in start_piece..=end_piece {
            match self
                .fs
                .scheduler()
                .wait_for_piece(piece, self.last_piece, &self.closed, self.seq)
                .await
            {
                Ok(()) => {}
                Err(StreamError::Aborted) => return Ok(0),
                Err(e) => return Err(e),
            }
        }

        let position = self.position;
        let Some(file) = self.disk_file().await? else {
            return Ok(0);
        };
        file.seek(SeekFrom::Start(position)).await?;

        let mut filled = 0;
        while filled < to_read {
            let n = file.read(&mut buf[filled..to_read]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.position += filled as u64;
        Ok(filled)
    }

    /// The payload file, opened on first use once it exists on disk
    async fn disk_file(&mut self) -> Result<Option<&mut File>> {
        if self.disk.is_none() {
            let poll = self.fs.scheduler().tunables().file_appear_poll();
            let path = self.info.save_path.clone();
            while tokio::fs::metadata(&path).await.is_err() {
                tokio::select! {
                    _ = self.closed.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            let file = File::open(&path)
                .await
                .map_err(|e| storage_error(&path, e))?;
            self.disk = Some(file);
        }
        Ok(self.disk.as_mut())
    }
}

fn storage_error(path: &Path, err: std::io::Error) -> StreamError {
    let mut converted = StreamError::from(err);
    if let StreamError::Storage { path: p, .. } = &mut converted {
        *p = path.to_path_buf();
    }
    converted
}

impl Drop for VirtualFile {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFile")
            .field("seq", &self.seq)
            .field("name", &self.info.entry.name)
            .field("size", &self.info.entry.size)
            .field("position", &self.position)
            .field("closed", &self.is_closed())
            .finish()
    }
}
