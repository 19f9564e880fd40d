//! JSON snapshots served on `/status` and `/ls`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::torrent::{TorrentStatus, NO_TORRENT};
use crate::vfs::FileInfo;

/// Torrent status as reported to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub name: String,
    /// State code, or -1 before the torrent has been added
    pub state: i32,
    pub state_str: String,
    pub error: String,
    pub progress: f32,
    /// kB/s
    pub download_rate: f32,
    /// kB/s
    pub upload_rate: f32,
    pub total_download: u64,
    pub total_upload: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    /// Seeds in the swarm according to trackers
    pub total_seeds: u32,
    /// Peers in the swarm according to trackers
    pub total_peers: u32,
}

impl SessionStatus {
    /// Snapshot before any torrent handle exists
    pub fn no_torrent() -> Self {
        Self {
            state: NO_TORRENT,
            ..Self::default()
        }
    }

    pub fn from_torrent(status: &TorrentStatus) -> Self {
        Self {
            name: status.name.clone(),
            state: status.state.code(),
            state_str: status.state.label().to_string(),
            error: status.error.clone(),
            progress: status.progress,
            download_rate: status.download_rate as f32 / 1024.0,
            upload_rate: status.upload_rate as f32 / 1024.0,
            total_download: status.total_download,
            total_upload: status.total_upload,
            num_peers: status.num_peers,
            num_seeds: status.num_seeds,
            total_seeds: status.num_complete,
            total_peers: status.num_incomplete,
        }
    }

    pub fn has_torrent(&self) -> bool {
        self.state != NO_TORRENT
    }
}

/// One entry of the `/ls` listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatusInfo {
    pub name: String,
    pub save_path: PathBuf,
    /// Direct link to the file's content
    pub url: String,
    pub size: u64,
    /// Offset within the torrent
    pub offset: u64,
    /// Bytes downloaded
    pub download: u64,
    pub progress: f32,
}

impl FileStatusInfo {
    /// Describe `file`, linking it under `base` (an `http://host:port/` URL)
    pub fn new(file: &FileInfo, base: &Url) -> Self {
        Self {
            name: file.name().to_string(),
            save_path: file.save_path.clone(),
            url: file_url(base, file.name()),
            size: file.size(),
            offset: file.entry.offset,
            download: file.downloaded,
            progress: file.progress(),
        }
    }
}

/// Response body of `/ls`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsInfo {
    pub files: Vec<FileStatusInfo>,
}

/// `base/files/<name>` with each path segment percent-encoded
pub fn file_url(base: &Url, name: &str) -> String {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push("files").extend(name.split('/'));
    }
    url.to_string()
}
