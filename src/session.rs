//! Stream Session - Main coordinator
//!
//! A `StreamSession` owns one engine session and the single torrent it serves.
//! It configures the engine, adds the torrent, exposes it over HTTP and runs
//! the lifecycle loop until something asks it to stop.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::http::{HttpServer, StreamBackend};
use crate::lifecycle::{self, ParentWatchdog, StopHandle, StopReason, StopReceiver};
use crate::retention::{self, RetentionPolicy};
use crate::status::{FileStatusInfo, LsInfo, SessionStatus};
use crate::torrent::{AddTorrentParams, DiscoveryService, Engine, IpFilter, TorrentHandle};
use crate::vfs::TorrentFs;

/// Session controller for one streamed torrent
pub struct StreamSession {
    config: Config,
    engine: Arc<dyn Engine>,
    stop_tx: StopHandle,
    /// Taken by the lifecycle loop
    stop_rx: Mutex<Option<StopReceiver>>,
    torrent: RwLock<Option<Arc<dyn TorrentHandle>>>,
    fs: RwLock<Option<Arc<TorrentFs>>>,
    http: RwLock<Option<Arc<HttpServer>>>,
    /// Services started, in start order
    services: Mutex<Vec<DiscoveryService>>,
    watchdog: ParentWatchdog,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl StreamSession {
    /// Validate `config` and create an idle session on top of `engine`
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Result<Arc<Self>> {
        config.validate()?;
        let (stop_tx, stop_rx) = lifecycle::stop_channel();
        let watchdog = ParentWatchdog::new(config.watch_parent);
        Ok(Arc::new(Self {
            config,
            engine,
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            torrent: RwLock::new(None),
            fs: RwLock::new(None),
            http: RwLock::new(None),
            services: Mutex::new(Vec::new()),
            watchdog,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Run a whole session: start, loop until stopped, shut down.
    ///
    /// Installs the global tracing subscriber per [`Config::verbose`] unless
    /// the embedder already installed one.
    pub async fn serve(config: Config, engine: Arc<dyn Engine>) -> Result<StopReason> {
        crate::logging::init(config.verbose);
        let session = Self::new(config, engine)?;
        let result = session.startup().await;
        session.shutdown().await;
        result
    }

    /// [`start`](Self::start) followed by [`run`](Self::run)
    pub async fn startup(self: &Arc<Self>) -> Result<StopReason> {
        self.start().await?;
        self.run().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configure the engine, add the torrent and bind HTTP.
    ///
    /// Returns the address the HTTP server listens on. Engine failures other
    /// than adding the torrent are logged and skipped.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StreamError::Shutdown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StreamError::Internal("session already started".to_string()));
        }

        let source = self.config.torrent_source()?;
        tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Starting session");
        self.configure_engine();
        self.start_services();

        tracing::debug!(%source, "Adding torrent");
        let handle = self.engine.add_torrent(AddTorrentParams {
            source,
            save_path: self.config.download_path.clone(),
            sparse: !self.config.no_sparse_file,
        })?;
        handle.set_sequential_download(true);
        for (url, tier) in self.config.tiered_trackers() {
            match handle.add_tracker(&url, tier) {
                Ok(()) => tracing::debug!(tracker = %url, tier, "Added tracker"),
                Err(e) => tracing::warn!(tracker = %url, "Failed to add tracker: {}", e),
            }
        }
        *self.torrent.write() = Some(handle.clone());

        let fs = TorrentFs::new(
            handle,
            self.config.file_index,
            self.config.streaming.clone(),
        );
        *self.fs.write() = Some(fs);

        let backend: Arc<dyn StreamBackend> = Arc::new(SessionBackend(Arc::downgrade(self)));
        let server = HttpServer::bind(&self.config.bind_address, backend).await?;
        let addr = server.local_addr();
        *self.http.write() = Some(Arc::new(server));
        Ok(addr)
    }

    fn configure_engine(&self) {
        let settings = self.config.engine_settings();
        tracing::debug!(
            user_agent = %settings.user_agent,
            encryption = %settings.encryption,
            download_limit = ?settings.download_rate_limit,
            upload_limit = ?settings.upload_rate_limit,
            "Applying engine settings"
        );
        if let Some(proxy) = &settings.proxy {
            tracing::debug!(host = %proxy.host, port = proxy.port, "Using SOCKS5 proxy");
        }
        if let Err(e) = self.engine.apply_settings(&settings) {
            tracing::warn!("Failed to apply engine settings: {}", e);
        }

        let ports = self.config.listen_ports();
        match self.engine.listen_on(ports.clone()) {
            Ok(port) => tracing::debug!(port, "Listening for peers"),
            Err(e) => tracing::warn!(?ports, "Failed to listen: {}", e),
        }

        for (host, port) in self.config.dht_router_list() {
            if let Err(e) = self.engine.add_dht_router(&host, port) {
                tracing::warn!(router = %host, port, "Failed to add DHT router: {}", e);
            }
        }

        if let Some(path) = &self.config.blocklist {
            let applied = IpFilter::from_file(path).and_then(|filter| {
                let rules = filter.len();
                self.engine.set_ip_filter(filter)?;
                Ok(rules)
            });
            match applied {
                Ok(rules) => tracing::debug!(rules, path = ?path, "Loaded IP blocklist"),
                Err(e) => tracing::warn!(path = ?path, "Failed to apply IP blocklist: {}", e),
            }
        }
    }

    fn start_services(&self) {
        let mut started = self.services.lock();
        for service in DiscoveryService::ALL {
            match self.engine.start_service(service) {
                Ok(()) => {
                    tracing::debug!(%service, "Started service");
                    started.push(service);
                }
                Err(e) => tracing::warn!(%service, "Failed to start service: {}", e),
            }
        }
    }

    fn stop_services(&self) {
        let started = std::mem::take(&mut *self.services.lock());
        for service in started.into_iter().rev() {
            match self.engine.stop_service(service) {
                Ok(()) => tracing::debug!(%service, "Stopped service"),
                Err(e) => tracing::warn!(%service, "Failed to stop service: {}", e),
            }
        }
    }

    /// The lifecycle loop.
    ///
    /// Every tick drains engine alerts, refreshes file progress and checks
    /// the parent process. Returns why it stopped. Only one caller may run it.
    pub async fn run(&self) -> Result<StopReason> {
        let mut stop_rx = self
            .stop_rx
            .lock()
            .take()
            .ok_or_else(|| StreamError::Internal("lifecycle loop already ran".to_string()))?;

        let signal = lifecycle::termination_signal();
        tokio::pin!(signal);
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                reason = stop_rx.recv() => break reason.unwrap_or(StopReason::Requested),
                reason = &mut signal => break reason,
                _ = tick.tick() => {
                    self.tick();
                    if self.watchdog.parent_exited() {
                        break StopReason::ParentExited;
                    }
                }
            }
        };
        tracing::info!("Stopping: {}", reason);
        Ok(reason)
    }

    fn tick(&self) {
        for alert in self.engine.pop_alerts() {
            tracing::debug!(category = %alert.category, "{}", alert.message);
        }
        if let Some(fs) = self.torrent_fs() {
            fs.load_file_progress();
        }
    }

    /// Ask the lifecycle loop to finish; safe from any task
    pub fn stop(&self) -> bool {
        let sent = self.stop_tx.request(StopReason::Requested);
        if sent {
            tracing::debug!("Stop requested");
        }
        sent
    }

    /// Tear the session down. Later calls do nothing.
    ///
    /// Stops discovery services, closes every open file, removes the torrent
    /// and applies the retention policy, stops HTTP, then closes the engine.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down");

        self.stop_services();

        let fs = self.fs.write().take();
        if let Some(fs) = &fs {
            fs.shutdown();
        }

        let handle = self.torrent.write().take();
        if let Some(handle) = handle {
            let state = handle.status().state;
            let files = fs
                .as_ref()
                .map(|fs| {
                    fs.load_file_progress();
                    fs.files()
                })
                .unwrap_or_default();

            tracing::debug!("Removing the torrent");
            if let Err(e) = self.engine.remove_torrent(&handle, false) {
                tracing::warn!("Failed to remove torrent: {}", e);
            }

            if let Some(fs) = &fs {
                let policy = RetentionPolicy::from_config(&self.config);
                match retention::apply(policy, state, &fs.save_root(), &files).await {
                    Ok(report) if !report.deleted.is_empty() => {
                        tracing::debug!(
                            deleted = report.deleted.len(),
                            kept = report.kept.len(),
                            "Cleaned up downloaded files"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to clean up files: {}", e),
                }
            }
        }

        let http = self.http.write().take();
        if let Some(http) = http {
            http.stop().await;
        }

        self.engine.close();
        tracing::debug!("Session closed");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Torrent status, or the `-1` sentinel before the torrent is added
    pub fn status(&self) -> SessionStatus {
        match self.torrent.read().as_ref() {
            Some(handle) => SessionStatus::from_torrent(&handle.status()),
            None => SessionStatus::no_torrent(),
        }
    }

    /// Every file with its progress and URL; empty until metadata arrives
    pub fn ls(&self) -> LsInfo {
        let Some(fs) = self.torrent_fs() else {
            return LsInfo::default();
        };
        let host = match self.local_addr() {
            Some(addr) if self.config.bind_address.ends_with(":0") => addr.to_string(),
            _ => self.config.bind_address.clone(),
        };
        let base = match Url::parse(&format!("http://{}/", host)) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(host = %host, "Cannot build file URLs: {}", e);
                return LsInfo::default();
            }
        };
        LsInfo {
            files: fs
                .files()
                .iter()
                .map(|file| FileStatusInfo::new(file, &base))
                .collect(),
        }
    }

    pub fn torrent_fs(&self) -> Option<Arc<TorrentFs>> {
        self.fs.read().clone()
    }

    pub fn torrent(&self) -> Option<Arc<dyn TorrentHandle>> {
        self.torrent.read().clone()
    }

    /// Bound HTTP address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.http.read().as_ref().map(|h| h.local_addr())
    }
}

/// Router state; weak so the server does not keep the session alive
struct SessionBackend(Weak<StreamSession>);

impl StreamBackend for SessionBackend {
    fn status(&self) -> SessionStatus {
        self.0
            .upgrade()
            .map(|s| s.status())
            .unwrap_or_else(SessionStatus::no_torrent)
    }

    fn ls(&self) -> LsInfo {
        self.0.upgrade().map(|s| s.ls()).unwrap_or_default()
    }

    fn torrent_fs(&self) -> Option<Arc<TorrentFs>> {
        self.0.upgrade().and_then(|s| s.torrent_fs())
    }

    fn request_stop(&self) {
        if let Some(session) = self.0.upgrade() {
            session.stop();
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(fs) = self.fs.get_mut().take() {
            fs.shutdown();
        }
    }
}
