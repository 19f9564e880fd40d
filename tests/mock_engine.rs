//! Mock BitTorrent Engine for Testing
//!
//! An in-memory [`Engine`] and [`TorrentHandle`]. The torrent knows its full
//! payload up front; tests decide when each piece "arrives", which writes its
//! bytes into the save directory and marks it present. Every priority and
//! deadline the streaming layer sets is recorded.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::io::{Seek, SeekFrom, Write};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use torrent2http::error::EngineErrorKind;
use torrent2http::{
    AddTorrentParams, Alert, DiscoveryService, Engine, EngineSettings, IpFilter, Result,
    StreamError, TorrentHandle, TorrentMetadata, TorrentState, TorrentStatus,
};

/// Default priority for files the streaming layer has not touched
const ENGINE_DEFAULT_PRIORITY: u8 = 1;

/// A torrent whose pieces arrive on demand
pub struct MockTorrent {
    meta: Arc<TorrentMetadata>,
    content: Vec<u8>,
    save_path: Mutex<PathBuf>,
    metadata_ready: AtomicBool,
    have: Mutex<Vec<bool>>,
    file_priorities: Mutex<Vec<u8>>,
    pub deadlines: Mutex<Vec<(u32, Duration)>>,
    pub priority_log: Mutex<Vec<(usize, u8)>>,
    pub sequential: AtomicBool,
    pub trackers: Mutex<Vec<(String, u8)>>,
    state: Mutex<TorrentState>,
}

impl MockTorrent {
    /// Torrent with metadata already known
    pub fn new(meta: Arc<TorrentMetadata>, content: Vec<u8>) -> Arc<Self> {
        assert_eq!(meta.total_size, content.len() as u64);
        let pieces = meta.num_pieces as usize;
        let files = meta.files.len();
        Arc::new(Self {
            meta,
            content,
            save_path: Mutex::new(PathBuf::new()),
            metadata_ready: AtomicBool::new(true),
            have: Mutex::new(vec![false; pieces]),
            file_priorities: Mutex::new(vec![ENGINE_DEFAULT_PRIORITY; files]),
            deadlines: Mutex::new(Vec::new()),
            priority_log: Mutex::new(Vec::new()),
            sequential: AtomicBool::new(false),
            trackers: Mutex::new(Vec::new()),
            state: Mutex::new(TorrentState::Downloading),
        })
    }

    /// Torrent that behaves like a magnet link until `publish_metadata`
    pub fn without_metadata(meta: Arc<TorrentMetadata>, content: Vec<u8>) -> Arc<Self> {
        let torrent = Self::new(meta, content);
        torrent.metadata_ready.store(false, Ordering::SeqCst);
        *torrent.state.lock() = TorrentState::DownloadingMetadata;
        torrent
    }

    pub fn publish_metadata(&self) {
        self.metadata_ready.store(true, Ordering::SeqCst);
        *self.state.lock() = TorrentState::Downloading;
    }

    pub fn set_state(&self, state: TorrentState) {
        *self.state.lock() = state;
    }

    pub fn set_save_path(&self, path: PathBuf) {
        *self.save_path.lock() = path;
    }

    pub fn meta(&self) -> &Arc<TorrentMetadata> {
        &self.meta
    }

    fn piece_range(&self, piece: u32) -> (u64, u64) {
        let start = piece as u64 * self.meta.piece_length;
        let end = (start + self.meta.piece_length).min(self.meta.total_size);
        (start, end)
    }

    /// Write `piece` into every file it overlaps and mark it present
    pub fn deliver(&self, piece: u32) {
        let (start, end) = self.piece_range(piece);
        let root = self.save_path.lock().clone();
        for file in &self.meta.files {
            let lo = start.max(file.offset);
            let hi = end.min(file.end());
            if lo >= hi {
                continue;
            }
            let path = root.join(&file.name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut out = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .unwrap();
            out.set_len(file.size).unwrap();
            out.seek(SeekFrom::Start(lo - file.offset)).unwrap();
            out.write_all(&self.content[lo as usize..hi as usize]).unwrap();
        }
        self.have.lock()[piece as usize] = true;
    }

    pub fn deliver_range(&self, pieces: RangeInclusive<u32>) {
        for piece in pieces {
            self.deliver(piece);
        }
    }

    pub fn deliver_all(&self) {
        self.deliver_range(0..=self.meta.num_pieces - 1);
    }

    pub fn present_pieces(&self) -> Vec<u32> {
        self.have
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, have)| **have)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn file_priority(&self, index: usize) -> u8 {
        self.file_priorities.lock()[index]
    }

    pub fn file_priorities(&self) -> Vec<u8> {
        self.file_priorities.lock().clone()
    }

    pub fn deadline_pieces(&self) -> Vec<u32> {
        self.deadlines.lock().iter().map(|(p, _)| *p).collect()
    }
}

impl TorrentHandle for MockTorrent {
    fn status(&self) -> TorrentStatus {
        let have = self.have.lock();
        let done = have.iter().filter(|h| **h).count();
        TorrentStatus {
            name: self.meta.name.clone(),
            state: *self.state.lock(),
            progress: done as f32 / have.len().max(1) as f32,
            download_rate: 4096,
            upload_rate: 1024,
            total_download: done as u64 * self.meta.piece_length,
            num_peers: 3,
            num_seeds: 1,
            num_complete: 12,
            num_incomplete: 30,
            has_metadata: self.metadata_ready.load(Ordering::SeqCst),
            ..TorrentStatus::default()
        }
    }

    fn metadata(&self) -> Option<Arc<TorrentMetadata>> {
        self.metadata_ready
            .load(Ordering::SeqCst)
            .then(|| self.meta.clone())
    }

    fn save_path(&self) -> PathBuf {
        self.save_path.lock().clone()
    }

    fn have_piece(&self, piece: u32) -> bool {
        self.have.lock().get(piece as usize).copied().unwrap_or(false)
    }

    /// Highest priority of the files the piece overlaps
    fn piece_priority(&self, piece: u32) -> u8 {
        let (start, end) = self.piece_range(piece);
        let priorities = self.file_priorities.lock();
        self.meta
            .files
            .iter()
            .filter(|f| f.size > 0 && f.offset < end && f.end() > start)
            .map(|f| priorities[f.index])
            .max()
            .unwrap_or(0)
    }

    fn set_file_priority(&self, index: usize, priority: u8) {
        self.file_priorities.lock()[index] = priority;
        self.priority_log.lock().push((index, priority));
    }

    fn set_piece_deadline(&self, piece: u32, deadline: Duration) {
        self.deadlines.lock().push((piece, deadline));
    }

    fn set_sequential_download(&self, enabled: bool) {
        self.sequential.store(enabled, Ordering::SeqCst);
    }

    fn file_progress(&self) -> Vec<u64> {
        let have = self.have.lock();
        self.meta
            .files
            .iter()
            .map(|file| {
                have.iter()
                    .enumerate()
                    .filter(|(_, h)| **h)
                    .map(|(piece, _)| {
                        let (start, end) = self.piece_range(piece as u32);
                        end.min(file.end()).saturating_sub(start.max(file.offset))
                    })
                    .sum()
            })
            .collect()
    }

    fn add_tracker(&self, url: &str, tier: u8) -> Result<()> {
        if url.starts_with("udp://bad") {
            return Err(StreamError::engine(EngineErrorKind::Tracker, "rejected"));
        }
        self.trackers.lock().push((url.to_string(), tier));
        Ok(())
    }
}

/// Engine handing out one prepared [`MockTorrent`]
pub struct MockEngine {
    torrent: Arc<MockTorrent>,
    /// Every call, in order, e.g. `start_service DHT`
    pub calls: Mutex<Vec<String>>,
    pub settings: Mutex<Option<EngineSettings>>,
    pub added: Mutex<Vec<AddTorrentParams>>,
    pub ip_filter: Mutex<Option<IpFilter>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub removed: AtomicUsize,
    pub closed: AtomicUsize,
    pub fail_listen: AtomicBool,
}

impl MockEngine {
    pub fn new(torrent: Arc<MockTorrent>) -> Arc<Self> {
        Arc::new(Self {
            torrent,
            calls: Mutex::new(Vec::new()),
            settings: Mutex::new(None),
            added: Mutex::new(Vec::new()),
            ip_filter: Mutex::new(None),
            alerts: Mutex::new(Vec::new()),
            removed: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            fail_listen: AtomicBool::new(false),
        })
    }

    pub fn torrent(&self) -> &Arc<MockTorrent> {
        &self.torrent
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn push_alert(&self, category: &str, message: &str) {
        self.alerts.lock().push(Alert::new(category, message));
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

impl Engine for MockEngine {
    fn apply_settings(&self, settings: &EngineSettings) -> Result<()> {
        self.record("apply_settings");
        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }

    fn listen_on(&self, ports: RangeInclusive<u16>) -> Result<u16> {
        self.record(format!("listen_on {}-{}", ports.start(), ports.end()));
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(StreamError::engine(EngineErrorKind::Listen, "address in use"));
        }
        Ok(*ports.start())
    }

    fn add_dht_router(&self, host: &str, port: u16) -> Result<()> {
        self.record(format!("add_dht_router {}:{}", host, port));
        Ok(())
    }

    fn set_ip_filter(&self, filter: IpFilter) -> Result<()> {
        self.record("set_ip_filter");
        *self.ip_filter.lock() = Some(filter);
        Ok(())
    }

    fn start_service(&self, service: DiscoveryService) -> Result<()> {
        self.record(format!("start_service {}", service));
        Ok(())
    }

    fn stop_service(&self, service: DiscoveryService) -> Result<()> {
        self.record(format!("stop_service {}", service));
        Ok(())
    }

    fn add_torrent(&self, params: AddTorrentParams) -> Result<Arc<dyn TorrentHandle>> {
        self.record("add_torrent");
        self.torrent.set_save_path(params.save_path.clone());
        self.added.lock().push(params);
        Ok(self.torrent.clone())
    }

    fn remove_torrent(&self, _handle: &Arc<dyn TorrentHandle>, delete_files: bool) -> Result<()> {
        self.record(format!("remove_torrent delete_files={}", delete_files));
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    fn close(&self) {
        self.record("close");
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
