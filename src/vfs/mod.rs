//! Virtual file system over a torrent
//!
//! [`TorrentFs`] exposes the torrent's files as if they were complete on
//! disk. Files are unknown until the engine has the metadata; opening anything
//! before then is a not-found error. Reads on a [`VirtualFile`] block until the
//! pieces under the cursor are downloaded.

mod dir;
mod file;

pub use dir::TorrentDir;
pub use file::{FileCloser, VirtualFile};

use parking_lot::RwLock;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::scheduler::PieceScheduler;
use crate::torrent::{FileEntry, TorrentHandle, TorrentMetadata};

/// A file's static metadata plus its download progress
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub entry: FileEntry,
    /// Absolute location on disk
    pub save_path: PathBuf,
    /// Verified bytes as of the last progress refresh
    pub downloaded: u64,
}

impl FileInfo {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn size(&self) -> u64 {
        self.entry.size
    }

    pub fn index(&self) -> usize {
        self.entry.index
    }

    /// Fraction downloaded; 0 for empty files
    pub fn progress(&self) -> f32 {
        if self.entry.size == 0 {
            0.0
        } else {
            self.downloaded as f32 / self.entry.size as f32
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded == self.entry.size
    }
}

/// Index of the largest file; the first one wins a tie
pub fn largest_file_index(files: &[FileEntry]) -> usize {
    let mut largest = 0;
    for (i, file) in files.iter().enumerate() {
        if file.size > files[largest].size {
            largest = i;
        }
    }
    largest
}

/// The torrent as a directory of seekable files
pub struct TorrentFs {
    handle: Arc<dyn TorrentHandle>,
    scheduler: PieceScheduler,
    metadata: watch::Sender<Option<Arc<TorrentMetadata>>>,
    /// Verified bytes per file, refreshed by [`TorrentFs::load_file_progress`]
    progress: RwLock<Vec<u64>>,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
}

impl TorrentFs {
    /// Create the file system and start waiting for metadata.
    ///
    /// A negative `file_index` selects the largest file once the file list is
    /// known. Must be called inside a tokio runtime.
    pub fn new(
        handle: Arc<dyn TorrentHandle>,
        file_index: i64,
        tunables: StreamingConfig,
    ) -> Arc<Self> {
        let (metadata, _) = watch::channel(None);
        let fs = Arc::new(Self {
            scheduler: PieceScheduler::new(handle.clone(), tunables),
            handle,
            metadata,
            progress: RwLock::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let waiter = fs.clone();
        tokio::spawn(async move { waiter.wait_for_metadata(file_index).await });
        fs
    }

    async fn wait_for_metadata(self: Arc<Self>, file_index: i64) {
        let poll = self.scheduler.tunables().metadata_poll();
        let meta = loop {
            if let Some(meta) = self.handle.metadata() {
                break meta;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        };

        let start = match usize::try_from(file_index) {
            Ok(index) if index < meta.files.len() => {
                tracing::debug!(index, "Start index");
                index
            }
            Ok(index) => {
                let largest = largest_file_index(&meta.files);
                tracing::warn!(
                    index,
                    files = meta.files.len(),
                    "File index out of range, using largest file {}",
                    largest
                );
                largest
            }
            Err(_) => {
                let largest = largest_file_index(&meta.files);
                tracing::debug!(index = largest, "Largest file index");
                largest
            }
        };

        self.scheduler.select_initial(&meta, start);
        self.load_file_progress();
        tracing::info!(
            name = %meta.name,
            files = meta.files.len(),
            pieces = meta.num_pieces,
            piece_length = meta.piece_length,
            "Torrent metadata available"
        );
        self.metadata.send_replace(Some(meta));
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.borrow().is_some()
    }

    pub fn metadata(&self) -> Option<Arc<TorrentMetadata>> {
        self.metadata.borrow().clone()
    }

    /// Wait until the file list is known
    pub async fn wait_metadata(&self) -> Result<Arc<TorrentMetadata>> {
        let mut rx = self.metadata.subscribe();
        tokio::select! {
            meta = rx.wait_for(Option::is_some) => meta
                .ok()
                .and_then(|m| m.clone())
                .ok_or(StreamError::Shutdown),
            _ = self.cancel.cancelled() => Err(StreamError::Shutdown),
        }
    }

    pub fn scheduler(&self) -> &PieceScheduler {
        &self.scheduler
    }

    /// Verified bytes of file `index` as of the last refresh
    pub(crate) fn downloaded(&self, index: usize) -> u64 {
        self.progress.read().get(index).copied().unwrap_or(0)
    }

    /// Absolute directory the torrent is saved under
    pub fn save_root(&self) -> PathBuf {
        let root = self.handle.save_path();
        std::path::absolute(&root)
            .map(|p| normalize(&p))
            .unwrap_or(root)
    }

    fn require_metadata(&self) -> Result<Arc<TorrentMetadata>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(StreamError::NotFound("shutting down".to_string()));
        }
        self.metadata()
            .ok_or_else(|| StreamError::NotFound("torrent metadata not available yet".to_string()))
    }

    /// Index of the largest file, once metadata is known
    pub fn find_largest_file_index(&self) -> Option<usize> {
        self.metadata().map(|meta| largest_file_index(&meta.files))
    }

    /// Refresh per-file verified byte counts from the engine
    pub fn load_file_progress(&self) {
        let progress = self.handle.file_progress();
        *self.progress.write() = progress;
    }

    fn info_for(&self, root: &Path, entry: &FileEntry) -> FileInfo {
        FileInfo {
            entry: entry.clone(),
            save_path: normalize(&root.join(&entry.name)),
            downloaded: self.downloaded(entry.index),
        }
    }

    /// All files with current progress; empty before metadata
    pub fn files(&self) -> Vec<FileInfo> {
        let Some(meta) = self.metadata() else {
            return Vec::new();
        };
        let root = self.save_root();
        meta.files.iter().map(|f| self.info_for(&root, f)).collect()
    }

    pub fn file_at(&self, index: usize) -> Result<FileInfo> {
        let meta = self.require_metadata()?;
        let entry = meta
            .file(index)
            .ok_or_else(|| StreamError::NotFound(format!("no file with index {}", index)))?;
        Ok(self.info_for(&self.save_root(), entry))
    }

    /// Resolve a torrent-relative name by its location under the save root
    pub fn file_by_name(&self, name: &str) -> Result<FileInfo> {
        let meta = self.require_metadata()?;
        let root = self.save_root();
        let wanted = normalize(&root.join(name.trim_start_matches('/')));
        if !wanted.starts_with(&root) || wanted == root {
            return Err(StreamError::NotFound(name.to_string()));
        }
        meta.files
            .iter()
            .map(|f| self.info_for(&root, f))
            .find(|info| info.save_path == wanted)
            .ok_or_else(|| StreamError::NotFound(name.to_string()))
    }

    /// Open a file for reading
    pub fn open(self: &Arc<Self>, name: &str) -> Result<VirtualFile> {
        let info = self.file_by_name(name)?;
        self.open_info(info)
    }

    /// Open a file by its index in the torrent
    pub fn open_index(self: &Arc<Self>, index: usize) -> Result<VirtualFile> {
        let info = self.file_at(index)?;
        self.open_info(info)
    }

    fn open_info(self: &Arc<Self>, info: FileInfo) -> Result<VirtualFile> {
        let meta = self.require_metadata()?;
        let registration = self.scheduler.open(&meta, &info.entry)?;
        Ok(VirtualFile::new(self.clone(), meta, info, registration))
    }

    /// Open the root directory listing
    pub fn open_dir(self: &Arc<Self>) -> Result<TorrentDir> {
        self.require_metadata()?;
        Ok(TorrentDir::new(self.clone()))
    }

    pub(crate) fn close_reader(&self, meta: &TorrentMetadata, seq: u64) -> bool {
        self.scheduler.close(meta, seq)
    }

    /// Refuse new opens and close every open file; returns how many were open
    pub fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.cancel.cancel();
        let meta = self.metadata();
        let closed = self.scheduler.close_all(meta.as_deref());
        if closed > 0 {
            tracing::debug!(closed, "Closed open file(s)");
        }
        closed
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_)) | None
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
