//! Piece Scheduling
//!
//! Turns "which byte ranges are being read" into file priorities and piece
//! deadlines on the engine:
//! - only files with an open reader are downloaded
//! - opening a file pulls its first and last pieces forward, plus a short
//!   graduated window before the last piece so seeks near the end are fast
//! - a blocked read puts a deadline on its piece and the one after it
//!
//! The reader registry and the priority table share one lock so priorities
//! are always derived from a consistent view of the open readers.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::torrent::{FileEntry, TorrentHandle, TorrentMetadata};

/// Priority of a file with an active reader
pub const PRIORITY_ON: u8 = 1;
/// Priority of a file nobody is reading
pub const PRIORITY_OFF: u8 = 0;

/// A reader's registration; cancelling `closed` unblocks its waits
#[derive(Debug, Clone)]
pub struct Registration {
    pub seq: u64,
    pub closed: CancellationToken,
}

struct Reader {
    seq: u64,
    file: usize,
    closed: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    /// Last priority sent to the engine per file
    priorities: BTreeMap<usize, u8>,
    readers: Vec<Reader>,
    last_seq: u64,
    /// Set by `close_all`; no reader may register afterwards
    closed: bool,
}

/// Priority and deadline policy for one torrent
pub struct PieceScheduler {
    handle: Arc<dyn TorrentHandle>,
    tunables: StreamingConfig,
    state: Mutex<SchedulerState>,
}

impl PieceScheduler {
    pub fn new(handle: Arc<dyn TorrentHandle>, tunables: StreamingConfig) -> Self {
        Self {
            handle,
            tunables,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn tunables(&self) -> &StreamingConfig {
        &self.tunables
    }

    /// Download only `start` until something is opened
    pub fn select_initial(&self, meta: &TorrentMetadata, start: usize) {
        let mut state = self.state.lock();
        for file in &meta.files {
            let priority = if file.index == start {
                PRIORITY_ON
            } else {
                PRIORITY_OFF
            };
            self.apply_priority(&mut state, file, priority);
        }
    }

    /// Last priority sent for `index`, 0 if never set
    pub fn priority(&self, index: usize) -> u8 {
        self.state
            .lock()
            .priorities
            .get(&index)
            .copied()
            .unwrap_or(PRIORITY_OFF)
    }

    /// Register a reader for `file` and pull its head and tail forward.
    ///
    /// Fails with NotFound once [`close_all`](Self::close_all) has run.
    pub fn open(&self, meta: &TorrentMetadata, file: &FileEntry) -> Result<Registration> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::NotFound(format!("{}: shutting down", file.name)));
        }
        state.last_seq += 1;
        let seq = state.last_seq;
        let closed = CancellationToken::new();

        tracing::debug!(seq, file = %file.name, size = file.size, "Opening file");
        self.apply_priority(&mut state, file, PRIORITY_ON);
        self.prioritize_edges(meta, file);

        state.readers.push(Reader {
            seq,
            file: file.index,
            closed: closed.clone(),
        });
        self.rederive(&mut state, meta);

        Ok(Registration { seq, closed })
    }

    /// Unregister reader `seq` and cancel its waits; false if already closed
    pub fn close(&self, meta: &TorrentMetadata, seq: u64) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.readers.iter().position(|r| r.seq == seq) else {
            return false;
        };
        let reader = state.readers.remove(pos);
        reader.closed.cancel();
        tracing::debug!(seq, file = reader.file, "Closed file");
        self.rederive(&mut state, meta);
        true
    }

    /// Close every reader and refuse new ones; returns how many were open.
    ///
    /// Without metadata there are no readers to close, but later opens are
    /// still refused.
    pub fn close_all(&self, meta: Option<&TorrentMetadata>) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let readers = std::mem::take(&mut state.readers);
        for reader in &readers {
            reader.closed.cancel();
        }
        if let Some(meta) = meta {
            self.rederive(&mut state, meta);
        }
        readers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn open_readers(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Indices of files with at least one reader
    pub fn open_files(&self) -> Vec<usize> {
        let state = self.state.lock();
        let mut files: Vec<usize> = state.readers.iter().map(|r| r.file).collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// Block until `piece` is on disk.
    ///
    /// `last` is the file's final piece, which bounds the one-piece lookahead.
    /// Returns [`StreamError::Aborted`] when `closed` fires or the engine stops
    /// wanting the piece; there is no other timeout.
    pub async fn wait_for_piece(
        &self,
        piece: u32,
        last: u32,
        closed: &CancellationToken,
        seq: u64,
    ) -> Result<()> {
        if self.handle.have_piece(piece) {
            return Ok(());
        }

        let deadline = self.tunables.read_deadline();
        self.handle.set_piece_deadline(piece, deadline);
        if piece < last && !self.handle.have_piece(piece + 1) {
            self.handle.set_piece_deadline(piece + 1, deadline);
        }
        tracing::debug!(seq, piece, "Waiting for piece");

        let poll = self.tunables.piece_poll();
        while !self.handle.have_piece(piece) {
            if closed.is_cancelled() || self.handle.piece_priority(piece) == PRIORITY_OFF {
                tracing::debug!(seq, piece, "Gave up waiting for piece");
                return Err(StreamError::Aborted);
            }
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
        Ok(())
    }

    /// Deadlines for the first and last pieces of `file` and the window before the last
    fn prioritize_edges(&self, meta: &TorrentMetadata, file: &FileEntry) {
        let (first, last) = meta.file_pieces(file);
        let head = self.tunables.head_deadline();

        if !self.handle.have_piece(first) {
            self.handle.set_piece_deadline(first, head);
        }
        if self.handle.have_piece(last) {
            return;
        }
        self.handle.set_piece_deadline(last, head);

        let window_start = last.saturating_sub(self.tunables.tail_window).max(first);
        for (n, piece) in (window_start..last).enumerate() {
            if piece == first || self.handle.have_piece(piece) {
                continue;
            }
            self.handle
                .set_piece_deadline(piece, self.tunables.tail_deadline(n as u32));
        }
    }

    /// Drop every file without a reader back to priority 0
    fn rederive(&self, state: &mut SchedulerState, meta: &TorrentMetadata) {
        let stale: Vec<usize> = state
            .priorities
            .iter()
            .filter(|&(index, priority)| {
                *priority != PRIORITY_OFF && !state.readers.iter().any(|r| r.file == *index)
            })
            .map(|(&index, _)| index)
            .collect();

        for index in stale {
            if let Some(file) = meta.file(index) {
                self.apply_priority(state, file, PRIORITY_OFF);
            }
        }
    }

    fn apply_priority(&self, state: &mut SchedulerState, file: &FileEntry, priority: u8) {
        if state.priorities.get(&file.index) == Some(&priority) {
            return;
        }
        tracing::debug!(file = %file.name, priority, "Setting file priority");
        state.priorities.insert(file.index, priority);
        self.handle.set_file_priority(file.index, priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{TorrentStatus, TorrentMetadata};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandle {
        have: Mutex<HashSet<u32>>,
        file_priorities: Mutex<BTreeMap<usize, u8>>,
        deadlines: Mutex<Vec<(u32, Duration)>>,
        zero_piece_priority: Mutex<bool>,
    }

    impl TorrentHandle for RecordingHandle {
        fn status(&self) -> TorrentStatus {
            TorrentStatus::default()
        }
        fn metadata(&self) -> Option<Arc<TorrentMetadata>> {
            None
        }
        fn save_path(&self) -> PathBuf {
            PathBuf::from(".")
        }
        fn have_piece(&self, piece: u32) -> bool {
            self.have.lock().contains(&piece)
        }
        fn piece_priority(&self, _piece: u32) -> u8 {
            if *self.zero_piece_priority.lock() {
                0
            } else {
                1
            }
        }
        fn set_file_priority(&self, index: usize, priority: u8) {
            self.file_priorities.lock().insert(index, priority);
        }
        fn set_piece_deadline(&self, piece: u32, deadline: Duration) {
            self.deadlines.lock().push((piece, deadline));
        }
        fn set_sequential_download(&self, _enabled: bool) {}
        fn file_progress(&self) -> Vec<u64> {
            Vec::new()
        }
        fn add_tracker(&self, _url: &str, _tier: u8) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingHandle>, PieceScheduler, TorrentMetadata) {
        let handle = Arc::new(RecordingHandle::default());
        let scheduler = PieceScheduler::new(handle.clone(), StreamingConfig::default());
        // 3 files over 20 pieces of 10 bytes: a=[0,1], b=[2..=17], c=[18,19]
        let meta =
            TorrentMetadata::new("t", 10, [("a", 20u64), ("b", 160), ("c", 20)]).unwrap();
        (handle, scheduler, meta)
    }

    #[test]
    fn test_initial_selection() {
        let (handle, scheduler, meta) = setup();
        scheduler.select_initial(&meta, 1);
        let prios = handle.file_priorities.lock().clone();
        assert_eq!(prios, BTreeMap::from([(0, 0), (1, 1), (2, 0)]));
    }

    #[test]
    fn test_priority_follows_open_readers() {
        let (handle, scheduler, meta) = setup();
        scheduler.select_initial(&meta, 1);

        let a1 = scheduler.open(&meta, &meta.files[0]).unwrap();
        // b has no reader yet, so opening a drops it
        assert_eq!(scheduler.priority(0), 1);
        assert_eq!(scheduler.priority(1), 0);

        let a2 = scheduler.open(&meta, &meta.files[0]).unwrap();
        assert!(scheduler.close(&meta, a1.seq));
        assert!(a1.closed.is_cancelled());
        assert_eq!(scheduler.priority(0), 1);

        assert!(scheduler.close(&meta, a2.seq));
        assert_eq!(scheduler.priority(0), 0);
        assert_eq!(handle.file_priorities.lock().get(&0), Some(&0));
        assert!(!scheduler.close(&meta, a2.seq));
    }

    #[test]
    fn test_unchanged_priority_is_not_resent() {
        let (handle, scheduler, meta) = setup();
        scheduler.select_initial(&meta, 0);
        handle.file_priorities.lock().clear();
        let _r = scheduler.open(&meta, &meta.files[0]).unwrap();
        assert!(handle.file_priorities.lock().is_empty());
    }

    #[test]
    fn test_open_sets_head_and_tail_deadlines() {
        let (handle, scheduler, meta) = setup();
        let _r = scheduler.open(&meta, &meta.files[1]).unwrap();
        let deadlines = handle.deadlines.lock().clone();
        let ms = |d: Duration| d.as_millis() as u64;
        let got: Vec<(u32, u64)> = deadlines.iter().map(|(p, d)| (*p, ms(*d))).collect();
        assert_eq!(
            got,
            vec![
                (2, 50),
                (17, 50),
                (11, 100),
                (12, 150),
                (13, 200),
                (14, 250),
                (15, 300),
                (16, 350)
            ]
        );
    }

    #[test]
    fn test_tail_window_stays_inside_file() {
        let (handle, scheduler, meta) = setup();
        let _r = scheduler.open(&meta, &meta.files[2]).unwrap();
        let pieces: Vec<u32> = handle.deadlines.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(pieces, vec![18, 19]);
    }

    #[test]
    fn test_present_pieces_get_no_deadline() {
        let (handle, scheduler, meta) = setup();
        handle.have.lock().extend([2, 17]);
        let _r = scheduler.open(&meta, &meta.files[1]).unwrap();
        assert!(handle.deadlines.lock().is_empty());
    }

    #[test]
    fn test_close_all_cancels_everyone() {
        let (_handle, scheduler, meta) = setup();
        let a = scheduler.open(&meta, &meta.files[0]).unwrap();
        let b = scheduler.open(&meta, &meta.files[1]).unwrap();
        assert_eq!(scheduler.open_files(), vec![0, 1]);
        assert_eq!(scheduler.close_all(Some(&meta)), 2);
        assert!(a.closed.is_cancelled() && b.closed.is_cancelled());
        assert_eq!(scheduler.open_readers(), 0);
        assert_eq!(scheduler.priority(1), 0);
        assert!(scheduler.is_closed());
        assert!(scheduler.open(&meta, &meta.files[0]).unwrap_err().is_not_found());
        assert_eq!(scheduler.open_readers(), 0);
    }

    #[test]
    fn test_close_all_without_metadata_refuses_opens() {
        let (_handle, scheduler, meta) = setup();
        assert_eq!(scheduler.close_all(None), 0);
        assert!(scheduler.open(&meta, &meta.files[1]).is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_when_piece_arrives() {
        let (handle, scheduler, _meta) = setup();
        let closed = CancellationToken::new();
        let h = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            h.have.lock().insert(5);
        });
        scheduler.wait_for_piece(5, 17, &closed, 1).await.unwrap();
        let pieces: Vec<u32> = handle.deadlines.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(pieces, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_wait_aborts_on_close() {
        let (_handle, scheduler, _meta) = setup();
        let closed = CancellationToken::new();
        let token = closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            scheduler.wait_for_piece(3, 17, &closed, 1),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(StreamError::Aborted)));
    }

    #[tokio::test]
    async fn test_wait_aborts_when_priority_revoked() {
        let (handle, scheduler, _meta) = setup();
        *handle.zero_piece_priority.lock() = true;
        let closed = CancellationToken::new();
        let result = scheduler.wait_for_piece(3, 17, &closed, 1).await;
        assert!(matches!(result, Err(StreamError::Aborted)));
    }
}
