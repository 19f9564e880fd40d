//! File retention when the torrent is removed
//!
//! Decides which payload files survive shutdown and deletes the rest,
//! pruning directories that end up empty. The download root itself is never
//! removed.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Result, StorageErrorKind, StreamError};
use crate::torrent::TorrentState;
use crate::vfs::FileInfo;

/// Which files to keep after the session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep everything
    pub keep_files: bool,
    pub keep_complete: bool,
    pub keep_incomplete: bool,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            keep_files: config.keep_files,
            keep_complete: config.keep_complete,
            keep_incomplete: config.keep_incomplete,
        }
    }

    pub fn keeps(&self, file: &FileInfo) -> bool {
        if self.keep_files {
            return true;
        }
        if file.is_complete() {
            self.keep_complete
        } else {
            self.keep_incomplete
        }
    }
}

/// What [`apply`] did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub pruned_dirs: Vec<PathBuf>,
}

/// Delete the files `policy` does not keep.
///
/// Nothing is touched while the torrent is still queued or checking, since no
/// payload exists yet. Files outside `root` are never deleted.
pub async fn apply(
    policy: RetentionPolicy,
    state: TorrentState,
    root: &Path,
    files: &[FileInfo],
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    if state.is_pre_download() {
        tracing::debug!(%state, "Torrent not started, nothing to clean");
        return Ok(report);
    }

    for file in files {
        if policy.keeps(file) {
            report.kept.push(file.save_path.clone());
            continue;
        }
        if !file.save_path.starts_with(root) || file.save_path == root {
            return Err(StreamError::storage(
                StorageErrorKind::PathTraversal,
                &file.save_path,
                "file is outside the download directory",
            ));
        }

        match tokio::fs::remove_file(&file.save_path).await {
            Ok(()) => {
                tracing::debug!(path = ?file.save_path, "Deleted file");
                report.deleted.push(file.save_path.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = ?file.save_path, "Failed to delete file: {}", e);
                continue;
            }
        }
        prune_empty_parents(root, &file.save_path, &mut report.pruned_dirs).await;
    }
    Ok(report)
}

/// Remove empty directories from `path`'s parent up to, not including, `root`
async fn prune_empty_parents(root: &Path, path: &Path, pruned: &mut Vec<PathBuf>) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the walk
        if tokio::fs::remove_dir(current).await.is_err() {
            break;
        }
        tracing::debug!(dir = ?current, "Removed empty directory");
        pruned.push(current.to_path_buf());
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentMetadata;
    use tempfile::TempDir;

    fn layout(root: &Path, downloaded: &[u64]) -> Vec<FileInfo> {
        let meta = TorrentMetadata::new(
            "Show",
            16,
            [("Show/Season 1/e01.mkv", 100u64), ("Show/Season 1/e02.mkv", 100), ("Show/notes.txt", 10)],
        )
        .unwrap();
        meta.files
            .iter()
            .zip(downloaded)
            .map(|(entry, done)| {
                let save_path = root.join(&entry.name);
                std::fs::create_dir_all(save_path.parent().unwrap()).unwrap();
                std::fs::write(&save_path, b"data").unwrap();
                FileInfo {
                    entry: entry.clone(),
                    save_path,
                    downloaded: *done,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_delete_all_prunes_directories() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[100, 40, 0]);

        let report = apply(RetentionPolicy::default(), TorrentState::Downloading, dir.path(), &files)
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 3);
        for f in &files {
            assert!(!f.save_path.exists());
        }
        assert!(!dir.path().join("Show").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_keep_files_leaves_everything() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[100, 40, 0]);
        let policy = RetentionPolicy {
            keep_files: true,
            ..Default::default()
        };

        let report = apply(policy, TorrentState::Seeding, dir.path(), &files).await.unwrap();

        assert!(report.deleted.is_empty());
        assert!(files.iter().all(|f| f.save_path.exists()));
    }

    #[tokio::test]
    async fn test_keep_complete_only() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[100, 40, 0]);
        let policy = RetentionPolicy {
            keep_complete: true,
            ..Default::default()
        };

        apply(policy, TorrentState::Downloading, dir.path(), &files).await.unwrap();

        assert!(files[0].save_path.exists());
        assert!(!files[1].save_path.exists());
        assert!(!files[2].save_path.exists());
        // e01 still lives there
        assert!(dir.path().join("Show/Season 1").exists());
    }

    #[tokio::test]
    async fn test_keep_incomplete_only() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[100, 40, 0]);
        let policy = RetentionPolicy {
            keep_incomplete: true,
            ..Default::default()
        };

        apply(policy, TorrentState::Finished, dir.path(), &files).await.unwrap();

        assert!(!files[0].save_path.exists());
        assert!(files[1].save_path.exists());
        assert!(files[2].save_path.exists());
    }

    #[tokio::test]
    async fn test_pre_download_state_is_untouched() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[0, 0, 0]);

        for state in [TorrentState::QueuedForChecking, TorrentState::CheckingFiles] {
            let report = apply(RetentionPolicy::default(), state, dir.path(), &files)
                .await
                .unwrap();
            assert_eq!(report, RetentionReport::default());
        }
        assert!(files.iter().all(|f| f.save_path.exists()));
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let files = layout(dir.path(), &[0, 0, 0]);
        std::fs::remove_file(&files[0].save_path).unwrap();

        let report = apply(RetentionPolicy::default(), TorrentState::Downloading, dir.path(), &files)
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_refuses_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let files = layout(other.path(), &[0, 0, 0]);

        let err = apply(RetentionPolicy::default(), TorrentState::Downloading, dir.path(), &files)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Storage {
                kind: StorageErrorKind::PathTraversal,
                ..
            }
        ));
        assert!(files[0].save_path.exists());
    }
}
