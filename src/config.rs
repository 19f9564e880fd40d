//! Session configuration
//!
//! A [`Config`] is a flat JSON object; every field is optional and falls back to
//! the defaults below. It is immutable once the session starts.

use crate::error::{Result, StreamError};
use crate::torrent::{EngineSettings, ProxySettings, TorrentMetadata, TorrentSource};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Port assumed for DHT routers given without one
pub const DEFAULT_DHT_PORT: u16 = 6881;

/// The listener binds the first free port in `listen_port..=listen_port + LISTEN_PORT_SPAN`
const LISTEN_PORT_SPAN: u16 = 10;

/// Lower bounds for `random_port`
const RANDOM_PORT_RANGE: std::ops::Range<u16> = 6881..6999;

const DEFAULT_DHT_ROUTERS: &str = "router.bittorrent.com:6881,router.utorrent.com:6881,\
                                   dht.transmissionbt.com:6881,dht.aelitis.com:6881";

/// Configuration for one streaming session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Magnet URI, `.torrent` URL, `file://` URL or local path
    pub uri: String,

    /// HTTP listen address
    pub bind_address: String,

    /// File to serve first; negative picks the largest file
    pub file_index: i64,

    /// kB/s, negative for unlimited
    pub max_upload_rate: i64,
    pub max_download_rate: i64,

    pub download_path: PathBuf,

    /// Empty uses `torrent2http/<version>`
    pub user_agent: String,

    /// Keep every file on shutdown (overrides the two flags below)
    pub keep_files: bool,
    pub keep_complete: bool,
    pub keep_incomplete: bool,

    pub encryption: EncryptionPolicy,

    /// Preallocate instead of using sparse files
    pub no_sparse_file: bool,

    /// Seconds
    pub peer_connect_timeout: u64,
    /// Seconds
    pub request_timeout: u64,

    /// Peers to connect to immediately after the first tracker response
    pub torrent_connect_boost: u32,

    /// Peer connection attempts per second
    pub connection_speed: u32,

    pub listen_port: u16,

    /// Seconds between retries to a failed peer, multiplied by its fail count
    pub min_reconnect_time: u64,
    pub max_fail_count: u32,

    /// Pick the listen port at random instead of using `listen_port`
    pub random_port: bool,

    /// Comma separated `host[:port]`
    pub dht_routers: String,

    /// Comma separated announce URLs added after the torrent's own
    pub trackers: String,

    /// Route engine traffic through a SOCKS5 proxy
    pub proxy: bool,
    pub proxy_host: String,
    pub proxy_port: u16,

    /// IP blocklist file
    pub blocklist: Option<PathBuf>,

    /// Debug-level logging; applied by [`StreamSession::serve`](crate::StreamSession::serve)
    pub verbose: bool,

    /// Lifecycle loop period in milliseconds
    pub tick_interval_ms: u64,

    /// Stop when the launching process goes away
    pub watch_parent: bool,

    pub streaming: StreamingConfig,
}

/// Peer connection encryption, as integer codes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum EncryptionPolicy {
    /// Only encrypted connections
    Forced,
    /// Encrypt when the peer supports it
    #[default]
    Enabled,
    Disabled,
}

impl From<EncryptionPolicy> for u8 {
    fn from(policy: EncryptionPolicy) -> Self {
        match policy {
            EncryptionPolicy::Forced => 0,
            EncryptionPolicy::Enabled => 1,
            EncryptionPolicy::Disabled => 2,
        }
    }
}

impl TryFrom<u8> for EncryptionPolicy {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Forced),
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Disabled),
            _ => Err(format!(
                "Invalid encryption policy {} (0=forced, 1=enabled, 2=disabled)",
                code
            )),
        }
    }
}

impl std::fmt::Display for EncryptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Piece deadline and polling tunables.
///
/// The defaults were tuned against real players; treat them as starting points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Deadline for the first and last piece of a newly opened file
    #[serde(default = "default_head_deadline_ms")]
    pub head_deadline_ms: u64,

    /// Pieces before the last one that get graduated deadlines on open
    #[serde(default = "default_tail_window")]
    pub tail_window: u32,

    /// Deadline of the first piece in the tail window
    #[serde(default = "default_tail_deadline_ms")]
    pub tail_deadline_ms: u64,

    /// Added per piece further into the tail window
    #[serde(default = "default_tail_deadline_step_ms")]
    pub tail_deadline_step_ms: u64,

    /// Deadline for a piece a reader is blocked on, and the one after it
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,

    /// How often a blocked reader rechecks piece availability
    #[serde(default = "default_poll_ms")]
    pub piece_poll_ms: u64,

    /// How often the file system checks for torrent metadata
    #[serde(default = "default_metadata_poll_ms")]
    pub metadata_poll_ms: u64,

    /// How often a reader checks for the payload file to appear on disk
    #[serde(default = "default_metadata_poll_ms")]
    pub file_appear_poll_ms: u64,
}

fn default_head_deadline_ms() -> u64 {
    50
}

fn default_tail_window() -> u32 {
    6
}

fn default_tail_deadline_ms() -> u64 {
    100
}

fn default_tail_deadline_step_ms() -> u64 {
    50
}

fn default_read_deadline_ms() -> u64 {
    50
}

fn default_poll_ms() -> u64 {
    50
}

fn default_metadata_poll_ms() -> u64 {
    100
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            head_deadline_ms: default_head_deadline_ms(),
            tail_window: default_tail_window(),
            tail_deadline_ms: default_tail_deadline_ms(),
            tail_deadline_step_ms: default_tail_deadline_step_ms(),
            read_deadline_ms: default_read_deadline_ms(),
            piece_poll_ms: default_poll_ms(),
            metadata_poll_ms: default_metadata_poll_ms(),
            file_appear_poll_ms: default_metadata_poll_ms(),
        }
    }
}

impl StreamingConfig {
    pub fn head_deadline(&self) -> Duration {
        Duration::from_millis(self.head_deadline_ms)
    }

    /// Deadline for the `n`th piece of the tail window, counting from 0
    pub fn tail_deadline(&self, n: u32) -> Duration {
        Duration::from_millis(self.tail_deadline_ms + n as u64 * self.tail_deadline_step_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn piece_poll(&self) -> Duration {
        Duration::from_millis(self.piece_poll_ms.max(1))
    }

    pub fn metadata_poll(&self) -> Duration {
        Duration::from_millis(self.metadata_poll_ms.max(1))
    }

    pub fn file_appear_poll(&self) -> Duration {
        Duration::from_millis(self.file_appear_poll_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: String::new(),
            bind_address: "localhost:5001".to_string(),
            file_index: -1,
            max_upload_rate: -1,
            max_download_rate: -1,
            download_path: PathBuf::from("."),
            user_agent: String::new(),
            keep_files: false,
            keep_complete: false,
            keep_incomplete: false,
            encryption: EncryptionPolicy::Enabled,
            no_sparse_file: false,
            peer_connect_timeout: 2,
            request_timeout: 5,
            torrent_connect_boost: 100,
            connection_speed: 100,
            listen_port: 6881,
            min_reconnect_time: 60,
            max_fail_count: 3,
            random_port: false,
            dht_routers: DEFAULT_DHT_ROUTERS.to_string(),
            trackers: String::new(),
            proxy: false,
            proxy_host: String::new(),
            proxy_port: 0,
            blocklist: None,
            verbose: false,
            tick_interval_ms: 500,
            watch_parent: true,
            streaming: StreamingConfig::default(),
        }
    }
}

impl Config {
    /// Create a config for `uri` with default values
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Parse a flat JSON object
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StreamError::config("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StreamError::Internal(e.to_string()))
    }

    /// Set the download directory
    pub fn download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    /// Set the HTTP listen address
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Serve this file index instead of the largest file
    pub fn file_index(mut self, index: i64) -> Self {
        self.file_index = index;
        self
    }

    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    pub fn keep_complete(mut self, keep: bool) -> Self {
        self.keep_complete = keep;
        self
    }

    pub fn keep_incomplete(mut self, keep: bool) -> Self {
        self.keep_incomplete = keep;
        self
    }

    /// Set rate limits in kB/s; negative is unlimited
    pub fn rate_limits(mut self, download: i64, upload: i64) -> Self {
        self.max_download_rate = download;
        self.max_upload_rate = upload;
        self
    }

    pub fn encryption(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption = policy;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn trackers(mut self, trackers: impl Into<String>) -> Self {
        self.trackers = trackers.into();
        self
    }

    pub fn dht_routers(mut self, routers: impl Into<String>) -> Self {
        self.dht_routers = routers.into();
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn random_port(mut self, random: bool) -> Self {
        self.random_port = random;
        self
    }

    /// Route engine traffic through a SOCKS5 proxy
    pub fn socks5_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = true;
        self.proxy_host = host.into();
        self.proxy_port = port;
        self
    }

    pub fn blocklist(mut self, path: impl Into<PathBuf>) -> Self {
        self.blocklist = Some(path.into());
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn watch_parent(mut self, watch: bool) -> Self {
        self.watch_parent = watch;
        self
    }

    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(StreamError::config("uri", "A magnet URI, URL or torrent path is required"));
        }

        if !self.download_path.exists() {
            return Err(StreamError::config(
                "download_path",
                format!("Directory does not exist: {:?}", self.download_path),
            ));
        }

        if !self.download_path.is_dir() {
            return Err(StreamError::config(
                "download_path",
                format!("Path is not a directory: {:?}", self.download_path),
            ));
        }

        if self.bind_address.trim().is_empty() {
            return Err(StreamError::config("bind_address", "Must not be empty"));
        }

        if self.proxy && (self.proxy_host.trim().is_empty() || self.proxy_port == 0) {
            return Err(StreamError::config(
                "proxy",
                "proxy_host and a non-zero proxy_port are required when proxy is enabled",
            ));
        }

        if self.tick_interval_ms == 0 {
            return Err(StreamError::config("tick_interval_ms", "Must be at least 1"));
        }

        if self.listen_port.checked_add(LISTEN_PORT_SPAN).is_none() {
            return Err(StreamError::config(
                "listen_port",
                format!("Must leave room for {} more ports", LISTEN_PORT_SPAN),
            ));
        }

        Ok(())
    }

    /// Resolve `uri` into something the engine can add.
    ///
    /// Local torrents are read and parsed here so failures surface at startup.
    pub fn torrent_source(&self) -> Result<TorrentSource> {
        let uri = self.uri.trim();
        if uri.starts_with("magnet:") {
            return Ok(TorrentSource::Magnet(uri.to_string()));
        }

        match Url::parse(uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(TorrentSource::Url(url)),
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| StreamError::config("uri", format!("Bad file URL: {}", uri)))?;
                local_source(&path)
            }
            // drive letters parse as one-letter schemes
            Ok(url) if url.scheme().len() > 1 => Err(StreamError::config(
                "uri",
                format!("Unsupported scheme '{}'", url.scheme()),
            )),
            _ => local_source(Path::new(uri)),
        }
    }

    /// DHT routers as `(host, port)`; entries with a bad port are skipped
    pub fn dht_router_list(&self) -> Vec<(String, u16)> {
        split_list(&self.dht_routers)
            .filter_map(|router| {
                let (host, port) = match router.split_once(':') {
                    Some((host, port)) => match port.trim().parse::<u16>() {
                        Ok(port) => (host.trim(), port),
                        Err(e) => {
                            tracing::warn!(router, "Skipping DHT router with bad port: {}", e);
                            return None;
                        }
                    },
                    None => (router, DEFAULT_DHT_PORT),
                };
                if host.is_empty() {
                    tracing::warn!(router, "Skipping DHT router without a host");
                    return None;
                }
                Some((host.to_string(), port))
            })
            .collect()
    }

    /// Extra trackers in the order given
    pub fn tracker_list(&self) -> Vec<String> {
        split_list(&self.trackers).map(String::from).collect()
    }

    /// Extra trackers with their tiers; they sort after the torrent's own
    pub fn tiered_trackers(&self) -> Vec<(String, u8)> {
        let trackers = self.tracker_list();
        let start = 256usize.saturating_sub(trackers.len());
        trackers
            .into_iter()
            .enumerate()
            .map(|(i, url)| (url, (start + i).min(u8::MAX as usize) as u8))
            .collect()
    }

    /// Peer listen port range
    pub fn listen_ports(&self) -> RangeInclusive<u16> {
        let lower = if self.random_port {
            rand::thread_rng().gen_range(RANDOM_PORT_RANGE)
        } else {
            self.listen_port
        };
        lower..=lower.saturating_add(LISTEN_PORT_SPAN)
    }

    /// Download limit in bytes/s
    pub fn download_rate_limit(&self) -> Option<u64> {
        kilobytes_to_bytes(self.max_download_rate)
    }

    /// Upload limit in bytes/s
    pub fn upload_rate_limit(&self) -> Option<u64> {
        kilobytes_to_bytes(self.max_upload_rate)
    }

    pub fn effective_user_agent(&self) -> String {
        if self.user_agent.is_empty() {
            format!("torrent2http/{}", env!("CARGO_PKG_VERSION"))
        } else {
            self.user_agent.clone()
        }
    }

    /// Session-wide settings for the engine
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            user_agent: self.effective_user_agent(),
            download_rate_limit: self.download_rate_limit(),
            upload_rate_limit: self.upload_rate_limit(),
            peer_connect_timeout: Duration::from_secs(self.peer_connect_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
            torrent_connect_boost: self.torrent_connect_boost,
            connection_speed: self.connection_speed,
            min_reconnect_time: Duration::from_secs(self.min_reconnect_time),
            max_fail_count: self.max_fail_count,
            encryption: self.encryption,
            proxy: self.proxy.then(|| ProxySettings {
                host: self.proxy_host.clone(),
                port: self.proxy_port,
            }),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn kilobytes_to_bytes(rate: i64) -> Option<u64> {
    u64::try_from(rate).ok().map(|kb| kb.saturating_mul(1024))
}

fn local_source(path: &Path) -> Result<TorrentSource> {
    let path = std::path::absolute(path).map_err(|e| {
        StreamError::config("uri", format!("Bad torrent path {}: {}", path.display(), e))
    })?;
    tracing::debug!(path = %path.display(), "Opening local torrent");
    let meta = TorrentMetadata::from_file(&path)?;
    Ok(TorrentSource::Metainfo(Arc::new(meta)))
}
