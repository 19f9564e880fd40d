//! Typed error hierarchy for torrent2http
//!
//! Errors are split by who has to act on them: configuration errors abort
//! startup, engine errors are logged and the session keeps going degraded,
//! not-found errors become 404s, and `Aborted` ends a blocked read cleanly.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the streaming layer
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid or unusable configuration (fatal at startup)
    #[error("Invalid config for '{field}': {message}")]
    Config {
        field: &'static str,
        message: String,
    },

    /// The BitTorrent engine rejected an operation
    #[error("Engine error ({kind:?}): {message}")]
    Engine {
        kind: EngineErrorKind,
        message: String,
    },

    /// Torrent metadata could not be parsed
    #[error("Invalid torrent metadata: {message}")]
    Metadata { message: String },

    /// Unknown file, bad index, or metadata not available yet
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem errors on the download directory
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// HTTP listener errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// A piece wait ended because the handle closed or its priority was revoked
    #[error("Read aborted")]
    Aborted,

    /// The session is shutting down
    #[error("Session is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Could not bind the peer listen port range
    Listen,
    /// Tracker could not be added
    Tracker,
    /// DHT router could not be added
    DhtRouter,
    /// Session settings were rejected
    Settings,
    /// Discovery service failed to start or stop
    Service,
    /// IP filter could not be applied
    IpFilter,
    /// The torrent could not be added
    AddTorrent,
    /// The torrent could not be removed
    RemoveTorrent,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Path escapes the download root
    PathTraversal,
    /// I/O error
    Io,
}

impl StreamError {
    /// Create a configuration error
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }

    /// Create an engine error
    pub fn engine(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self::Engine {
            kind,
            message: message.into(),
        }
    }

    /// Create a metadata error
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether this error should surface as a 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Storage {
                    kind: StorageErrorKind::NotFound | StorageErrorKind::PathTraversal,
                    ..
                }
        )
    }

    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Metadata { .. } | Self::Http(_))
    }
}

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::config("json", err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        Self::config("uri", err.to_string())
    }
}
