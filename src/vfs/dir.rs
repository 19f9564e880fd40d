use std::sync::Arc;

use super::{FileInfo, TorrentFs};
use crate::error::Result;

/// Paginated listing of every file in the torrent.
///
/// Each call to [`TorrentDir::readdir`] continues where the previous one
/// stopped, like `readdir(3)` on an open directory.
pub struct TorrentDir {
    fs: Arc<TorrentFs>,
    entries_read: usize,
}

impl TorrentDir {
    pub(super) fn new(fs: Arc<TorrentFs>) -> Self {
        Self {
            fs,
            entries_read: 0,
        }
    }

    /// Next `count` entries, or all remaining ones when `count` is 0.
    ///
    /// Returns an empty vec once the listing is exhausted.
    pub fn readdir(&mut self, count: usize) -> Result<Vec<FileInfo>> {
        self.fs.require_metadata()?;
        let files = self.fs.files();
        let remaining = files.len().saturating_sub(self.entries_read);
        let take = if count == 0 {
            remaining
        } else {
            count.min(remaining)
        };

        let batch: Vec<FileInfo> = files
            .into_iter()
            .skip(self.entries_read)
            .take(take)
            .collect();
        self.entries_read += batch.len();
        Ok(batch)
    }

    /// Start the listing over
    pub fn rewind(&mut self) {
        self.entries_read = 0;
    }

    pub fn entries_read(&self) -> usize {
        self.entries_read
    }
}
