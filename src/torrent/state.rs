//! Torrent lifecycle states
//!
//! The numeric codes are part of the `/status` wire format and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Code reported before the engine has handed back a torrent handle
pub const NO_TORRENT: i32 = -1;

/// Lifecycle state of the served torrent, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TorrentState {
    /// Waiting in the engine's checking queue
    QueuedForChecking,
    /// Verifying pieces already on disk
    CheckingFiles,
    /// Magnet/URL source; fetching the info dictionary
    DownloadingMetadata,
    Downloading,
    /// All wanted pieces are present
    Finished,
    Seeding,
    /// Reserving disk space
    Allocating,
    CheckingResumeData,
}

impl TorrentState {
    pub const ALL: [TorrentState; 8] = [
        Self::QueuedForChecking,
        Self::CheckingFiles,
        Self::DownloadingMetadata,
        Self::Downloading,
        Self::Finished,
        Self::Seeding,
        Self::Allocating,
        Self::CheckingResumeData,
    ];

    /// Wire code of this state
    pub fn code(self) -> i32 {
        match self {
            Self::QueuedForChecking => 0,
            Self::CheckingFiles => 1,
            Self::DownloadingMetadata => 2,
            Self::Downloading => 3,
            Self::Finished => 4,
            Self::Seeding => 5,
            Self::Allocating => 6,
            Self::CheckingResumeData => 7,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Human readable label reported as `state_str`
    pub fn label(self) -> &'static str {
        match self {
            Self::QueuedForChecking => "Queued",
            Self::CheckingFiles => "Checking",
            Self::DownloadingMetadata => "Downloading torrent metadata",
            Self::Downloading => "Downloading",
            Self::Finished => "Finished",
            Self::Seeding => "Seeding",
            Self::Allocating => "Allocating",
            Self::CheckingResumeData => "Checking resume data",
        }
    }

    /// No payload has been written yet in these states, so there is nothing to clean up
    pub fn is_pre_download(self) -> bool {
        matches!(self, Self::QueuedForChecking | Self::CheckingFiles)
    }

    /// Every wanted byte is on disk
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Finished | Self::Seeding)
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<TorrentState> for i32 {
    fn from(state: TorrentState) -> Self {
        state.code()
    }
}

impl TryFrom<i32> for TorrentState {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("Unknown torrent state code: {}", code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_dense_and_stable() {
        for (i, state) in TorrentState::ALL.iter().enumerate() {
            assert_eq!(state.code(), i as i32);
            assert_eq!(TorrentState::from_code(i as i32), Some(*state));
        }
        assert_eq!(TorrentState::from_code(NO_TORRENT), None);
        assert_eq!(TorrentState::from_code(8), None);
    }

    #[test]
    fn test_labels() {
        assert_eq!(TorrentState::QueuedForChecking.label(), "Queued");
        assert_eq!(
            TorrentState::DownloadingMetadata.to_string(),
            "Downloading torrent metadata"
        );
    }

    #[test]
    fn test_pre_download_states() {
        assert!(TorrentState::QueuedForChecking.is_pre_download());
        assert!(TorrentState::CheckingFiles.is_pre_download());
        assert!(!TorrentState::CheckingResumeData.is_pre_download());
        assert!(!TorrentState::Downloading.is_pre_download());
    }

    #[test]
    fn test_serde_as_integer() {
        let json = serde_json::to_string(&TorrentState::Seeding).unwrap();
        assert_eq!(json, "5");
        let state: TorrentState = serde_json::from_str("3").unwrap();
        assert_eq!(state, TorrentState::Downloading);
        assert!(serde_json::from_str::<TorrentState>("42").is_err());
    }
}
