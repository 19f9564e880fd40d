//! # torrent2http
//!
//! Stream a file out of an in-progress BitTorrent download over HTTP.
//!
//! A media player can start playback before the download completes and seek
//! anywhere in the file. Reads block until the pieces they need arrive, and
//! the piece scheduler fetches the pieces under open readers first.
//!
//! ## Features
//!
//! - **Virtual files**: seekable, blocking reads over a partially downloaded torrent
//! - **Piece scheduling**: only open files download; file edges and the read cursor get deadlines
//! - **HTTP**: `/status`, `/ls`, `/files/<name>` and `/get/<index>` with `Range` support
//! - **Lifecycle**: stop requests, SIGINT/SIGTERM and an orphan watchdog
//! - **Retention**: keep or delete complete and incomplete files on exit
//!
//! The BitTorrent protocol itself is delegated to an [`Engine`] implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torrent2http::{Config, Engine, StreamSession};
//! # fn engine() -> Arc<dyn Engine> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("magnet:?xt=urn:btih:...")
//!         .download_path("/tmp/downloads")
//!         .verbose(true)
//!         .bind_address("127.0.0.1:5001");
//!
//!     // Runs until GET /shutdown, SIGINT/SIGTERM or the parent exits
//!     let reason = StreamSession::serve(config, engine()).await?;
//!     println!("Stopped: {}", reason);
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod retention;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod torrent;
pub mod vfs;

// Re-exports for convenience
pub use config::{Config, EncryptionPolicy, StreamingConfig};
pub use error::{EngineErrorKind, Result, StorageErrorKind, StreamError};
pub use session::StreamSession;
pub use status::{FileStatusInfo, LsInfo, SessionStatus};

// Engine seam exports
pub use torrent::{
    AddTorrentParams, Alert, DiscoveryService, Engine, EngineSettings, FileEntry, IpFilter,
    ProxySettings, TorrentHandle, TorrentMetadata, TorrentSource, TorrentState, TorrentStatus,
};

// Streaming exports
pub use lifecycle::StopReason;
pub use retention::RetentionPolicy;
pub use scheduler::PieceScheduler;
pub use vfs::{FileInfo, TorrentDir, TorrentFs, VirtualFile};

// HTTP exports
pub use http::{ContentSource, HttpServer, StreamBackend};
