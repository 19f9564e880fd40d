//! BitTorrent engine seam
//!
//! The streaming layer never speaks the wire protocol itself. It drives an
//! engine through the [`Engine`] and [`TorrentHandle`] traits:
//! - session-wide settings, listen ports, DHT routers and the IP filter
//! - discovery services (DHT, LSD, UPnP, NAT-PMP)
//! - per-torrent file priorities, piece deadlines and sequential mode
//! - piece availability and status snapshots
//!
//! Implementations must be cheap to call from many reader tasks at once;
//! the streaming layer adds no locking around them.

pub mod bencode;
pub mod ip_filter;
pub mod metainfo;
pub mod state;

pub use ip_filter::IpFilter;
pub use metainfo::{FileEntry, InfoHash, TorrentMetadata};
pub use state::{TorrentState, NO_TORRENT};

use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::EncryptionPolicy;
use crate::error::Result;

/// Where the torrent comes from
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// `magnet:` URI; metadata arrives from peers
    Magnet(String),
    /// Remote `.torrent`; the engine fetches it
    Url(Url),
    /// Local `.torrent`, already parsed
    Metainfo(Arc<TorrentMetadata>),
}

impl fmt::Display for TorrentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Magnet(uri) => write!(f, "{}", uri),
            Self::Url(url) => write!(f, "{}", url),
            Self::Metainfo(meta) => write!(f, "local torrent '{}'", meta.name),
        }
    }
}

/// SOCKS5 proxy the engine routes peer, tracker and DHT traffic through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

/// Session-wide engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub user_agent: String,
    /// Bytes per second, `None` for unlimited
    pub download_rate_limit: Option<u64>,
    pub upload_rate_limit: Option<u64>,
    pub peer_connect_timeout: Duration,
    pub request_timeout: Duration,
    pub torrent_connect_boost: u32,
    pub connection_speed: u32,
    pub min_reconnect_time: Duration,
    pub max_fail_count: u32,
    pub encryption: EncryptionPolicy,
    pub proxy: Option<ProxySettings>,
}

/// Peer discovery services, in start order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryService {
    Dht,
    Lsd,
    Upnp,
    Natpmp,
}

impl DiscoveryService {
    pub const ALL: [DiscoveryService; 4] = [Self::Dht, Self::Lsd, Self::Upnp, Self::Natpmp];
}

impl fmt::Display for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dht => write!(f, "DHT"),
            Self::Lsd => write!(f, "LSD"),
            Self::Upnp => write!(f, "UPNP"),
            Self::Natpmp => write!(f, "NATPMP"),
        }
    }
}

/// Parameters for adding the served torrent
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub source: TorrentSource,
    pub save_path: PathBuf,
    /// Sparse files; `false` preallocates
    pub sparse: bool,
}

/// Point-in-time torrent status as reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub name: String,
    pub state: TorrentState,
    /// Last engine error, empty when healthy
    pub error: String,
    /// 0.0 to 1.0
    pub progress: f32,
    /// Bytes per second
    pub download_rate: u64,
    pub upload_rate: u64,
    pub total_download: u64,
    pub total_upload: u64,
    /// Connected peers, seeds included
    pub num_peers: u32,
    pub num_seeds: u32,
    /// Swarm-wide counts from tracker scrapes
    pub num_complete: u32,
    pub num_incomplete: u32,
    pub has_metadata: bool,
}

impl Default for TorrentStatus {
    fn default() -> Self {
        Self {
            name: String::new(),
            state: TorrentState::QueuedForChecking,
            error: String::new(),
            progress: 0.0,
            download_rate: 0,
            upload_rate: 0,
            total_download: 0,
            total_upload: 0,
            num_peers: 0,
            num_seeds: 0,
            num_complete: 0,
            num_incomplete: 0,
            has_metadata: false,
        }
    }
}

/// Informational engine notification, drained every tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub category: String,
    pub message: String,
}

impl Alert {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// A BitTorrent session
pub trait Engine: Send + Sync {
    fn apply_settings(&self, settings: &EngineSettings) -> Result<()>;

    /// Bind the peer listener somewhere in `ports`; returns the port in use
    fn listen_on(&self, ports: RangeInclusive<u16>) -> Result<u16>;

    fn add_dht_router(&self, host: &str, port: u16) -> Result<()>;

    fn set_ip_filter(&self, filter: IpFilter) -> Result<()>;

    fn start_service(&self, service: DiscoveryService) -> Result<()>;

    fn stop_service(&self, service: DiscoveryService) -> Result<()>;

    fn add_torrent(&self, params: AddTorrentParams) -> Result<Arc<dyn TorrentHandle>>;

    /// Remove a torrent, optionally deleting its payload from disk
    fn remove_torrent(&self, handle: &Arc<dyn TorrentHandle>, delete_files: bool) -> Result<()>;

    /// Take every pending alert
    fn pop_alerts(&self) -> Vec<Alert>;

    /// Release the session; no further calls follow
    fn close(&self);
}

/// A torrent inside an [`Engine`]
pub trait TorrentHandle: Send + Sync {
    fn status(&self) -> TorrentStatus;

    /// `None` until the info dictionary is known
    fn metadata(&self) -> Option<Arc<TorrentMetadata>>;

    /// Directory the torrent's file paths are relative to
    fn save_path(&self) -> PathBuf;

    /// Whether `piece` is downloaded and verified
    fn have_piece(&self, piece: u32) -> bool;

    /// Effective priority of `piece`; 0 means it will not be downloaded
    fn piece_priority(&self, piece: u32) -> u8;

    fn set_file_priority(&self, index: usize, priority: u8);

    /// Ask for `piece` within `deadline`, ahead of normal ordering
    fn set_piece_deadline(&self, piece: u32, deadline: Duration);

    fn set_sequential_download(&self, enabled: bool);

    /// Verified bytes per file, in file order
    fn file_progress(&self) -> Vec<u64>;

    fn add_tracker(&self, url: &str, tier: u8) -> Result<()>;
}
