//! Deterministic in-process torrent engine for tests and development.
//!
//! Torrents are scripted up front and registered under their info hash.
//! Progress moves only when the test calls [`SimulatedTorrent::advance`] or,
//! when a download rate is configured, as wall-clock time passes after the
//! metadata is released. Pieces are assumed to arrive sequentially.

use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{
    DownloadPriority, InfoHash, SourceLink, TorrentClient, TorrentError, TorrentFile,
    TorrentHandle,
};
use crate::streaming::{PieceProvider, PieceProviderError};

/// Piece size used when none is given.
pub const DEFAULT_PIECE_LENGTH: u64 = 256 * 1024;

/// Priority hint recorded by a simulated torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityChange {
    File {
        index: usize,
        priority: DownloadPriority,
    },
    Pieces {
        range: Range<u32>,
        priority: DownloadPriority,
    },
}

/// Torrent client backed by scripted [`SimulatedTorrent`]s.
pub struct SimulatedTorrentClient {
    download_dir: PathBuf,
    torrents: Mutex<HashMap<InfoHash, SimulatedTorrent>>,
}

impl SimulatedTorrentClient {
    /// Creates a client that materializes completed files under `download_dir`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            torrents: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `torrent` available to `add_source` for `link`.
    pub fn register(&self, link: &SourceLink, torrent: SimulatedTorrent) {
        self.torrents.lock().insert(link.info_hash(), torrent);
    }

    /// Returns the controller registered for `info_hash`.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<SimulatedTorrent> {
        self.torrents.lock().get(&info_hash).cloned()
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }
}

#[async_trait]
impl TorrentClient for SimulatedTorrentClient {
    async fn add_source(&self, link: &SourceLink) -> Result<Arc<dyn TorrentHandle>, TorrentError> {
        let torrent = self
            .torrent(link.info_hash())
            .ok_or_else(|| TorrentError::Engine {
                reason: format!("no simulated torrent registered for {}", link.info_hash()),
            })?;

        torrent.state.adds.fetch_add(1, Ordering::SeqCst);
        debug!(info_hash = %link.info_hash(), "Simulated torrent added");

        Ok(Arc::new(SimulatedHandle {
            info_hash: link.info_hash(),
            torrent,
            download_dir: self.download_dir.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedState {
    files: Vec<TorrentFile>,
    offsets: Vec<u64>,
    total_length: u64,
    metadata: watch::Sender<bool>,
    metadata_released_at: Mutex<Option<Instant>>,
    completed: AtomicU64,
    /// Bytes per second once metadata is released, 0 = manual only
    rate: AtomicU64,
    broken: AtomicBool,
    materialized: AtomicBool,
    adds: AtomicUsize,
    priority_changes: Mutex<Vec<PriorityChange>>,
}

/// Test-side controller for one simulated torrent.
#[derive(Clone)]
pub struct SimulatedTorrent {
    state: Arc<SimulatedState>,
}

impl SimulatedTorrent {
    /// Creates a torrent with the given `(path, length)` files.
    pub fn new<P: Into<PathBuf>>(files: impl IntoIterator<Item = (P, u64)>) -> Self {
        Self::with_piece_length(files, DEFAULT_PIECE_LENGTH)
    }

    /// Creates a torrent with an explicit piece length.
    pub fn with_piece_length<P: Into<PathBuf>>(
        files: impl IntoIterator<Item = (P, u64)>,
        piece_length: u64,
    ) -> Self {
        let piece_length = piece_length.max(1);
        let mut offset = 0u64;
        let mut offsets = Vec::new();
        let mut torrent_files = Vec::new();

        for (index, (path, length)) in files.into_iter().enumerate() {
            let first_piece = offset / piece_length;
            let end_piece = if length == 0 {
                first_piece
            } else {
                (offset + length - 1) / piece_length + 1
            };

            torrent_files.push(TorrentFile {
                index,
                path: path.into(),
                length,
                pieces: first_piece as u32..end_piece as u32,
            });
            offsets.push(offset);
            offset += length;
        }

        let (metadata, _) = watch::channel(false);

        Self {
            state: Arc::new(SimulatedState {
                files: torrent_files,
                offsets,
                total_length: offset,
                metadata,
                metadata_released_at: Mutex::new(None),
                completed: AtomicU64::new(0),
                rate: AtomicU64::new(0),
                broken: AtomicBool::new(false),
                materialized: AtomicBool::new(false),
                adds: AtomicUsize::new(0),
                priority_changes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Downloads at `bytes_per_sec` once metadata is released.
    pub fn with_download_rate(self, bytes_per_sec: u64) -> Self {
        self.state.rate.store(bytes_per_sec, Ordering::SeqCst);
        self
    }

    /// Publishes the file list to every waiting handle.
    pub fn release_metadata(&self) {
        *self.state.metadata_released_at.lock() = Some(Instant::now());
        self.state.metadata.send_replace(true);
    }

    /// Marks `bytes` more data as downloaded.
    pub fn advance(&self, bytes: u64) {
        let total = self.state.total_length;
        let _ = self
            .state
            .completed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(bytes).min(total))
            });
    }

    /// Marks every byte as downloaded.
    pub fn complete(&self) {
        self.state
            .completed
            .store(self.state.total_length, Ordering::SeqCst);
    }

    /// Makes every handle fail as if the engine dropped the torrent.
    pub fn break_connection(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }

    /// Number of times this torrent was added to the client.
    pub fn add_count(&self) -> usize {
        self.state.adds.load(Ordering::SeqCst)
    }

    /// Priority hints received so far, oldest first.
    pub fn priority_changes(&self) -> Vec<PriorityChange> {
        self.state.priority_changes.lock().clone()
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.state.files
    }

    pub fn total_length(&self) -> u64 {
        self.state.total_length
    }

    /// Downloaded bytes, including those accrued from the download rate.
    pub fn completed_bytes(&self) -> u64 {
        let manual = self.state.completed.load(Ordering::SeqCst);
        let rate = self.state.rate.load(Ordering::SeqCst);
        let released_at = *self.state.metadata_released_at.lock();

        let timed = match (rate, released_at) {
            (0, _) | (_, None) => 0,
            (rate, Some(at)) => (at.elapsed().as_secs_f64() * rate as f64) as u64,
        };

        manual.max(timed).min(self.state.total_length)
    }

    fn metadata_ready(&self) -> bool {
        *self.state.metadata.borrow()
    }

    fn is_broken(&self) -> bool {
        self.state.broken.load(Ordering::SeqCst)
    }

    fn file_offset(&self, index: usize) -> Option<u64> {
        self.state.offsets.get(index).copied()
    }

    fn record(&self, change: PriorityChange) {
        self.state.priority_changes.lock().push(change);
    }

    /// Creates every file on disk at full size once the torrent is complete.
    fn materialize(&self, download_dir: &Path) -> Result<(), TorrentError> {
        if self.state.materialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for file in &self.state.files {
            let path = download_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                create_dir_all(parent).map_err(|e| TorrentError::io(parent, e))?;
            }
            File::create(&path)
                .and_then(|handle| handle.set_len(file.length))
                .map_err(|e| TorrentError::io(&path, e))?;
        }

        Ok(())
    }
}

struct SimulatedHandle {
    info_hash: InfoHash,
    torrent: SimulatedTorrent,
    download_dir: PathBuf,
    closed: AtomicBool,
}

impl SimulatedHandle {
    fn ensure_open(&self) -> Result<(), TorrentError> {
        if self.closed.load(Ordering::SeqCst) || self.torrent.is_broken() {
            return Err(TorrentError::HandleClosed {
                info_hash: self.info_hash,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentHandle for SimulatedHandle {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    async fn wait_for_metadata(&self) -> Result<(), TorrentError> {
        self.ensure_open()?;
        let mut ready = self.torrent.state.metadata.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| TorrentError::HandleClosed {
                info_hash: self.info_hash,
            })?;
        Ok(())
    }

    fn files(&self) -> Result<Vec<TorrentFile>, TorrentError> {
        if !self.torrent.metadata_ready() {
            return Err(TorrentError::MetadataUnavailable);
        }
        Ok(self.torrent.state.files.clone())
    }

    async fn set_file_priority(
        &self,
        index: usize,
        priority: DownloadPriority,
    ) -> Result<(), TorrentError> {
        self.ensure_open()?;
        if index >= self.torrent.state.files.len() {
            return Err(TorrentError::FileNotFound { index });
        }
        self.torrent.record(PriorityChange::File { index, priority });
        Ok(())
    }

    async fn set_piece_priority(
        &self,
        pieces: Range<u32>,
        priority: DownloadPriority,
    ) -> Result<(), TorrentError> {
        self.ensure_open()?;
        self.torrent.record(PriorityChange::Pieces {
            range: pieces,
            priority,
        });
        Ok(())
    }

    fn bytes_completed(&self) -> Result<u64, TorrentError> {
        self.ensure_open()?;
        let completed = self.torrent.completed_bytes();
        if completed >= self.torrent.total_length() {
            self.torrent.materialize(&self.download_dir)?;
        }
        Ok(completed)
    }

    fn file_bytes_completed(&self, file: &TorrentFile) -> Result<u64, TorrentError> {
        self.ensure_open()?;
        let file_offset = self
            .torrent
            .file_offset(file.index)
            .ok_or(TorrentError::FileNotFound { index: file.index })?;

        Ok(self
            .torrent
            .completed_bytes()
            .saturating_sub(file_offset)
            .min(file.length))
    }

    fn total_length(&self) -> Result<u64, TorrentError> {
        if !self.torrent.metadata_ready() {
            return Err(TorrentError::MetadataUnavailable);
        }
        Ok(self.torrent.total_length())
    }

    fn local_path(&self, file: &TorrentFile) -> PathBuf {
        self.download_dir.join(&file.path)
    }

    fn reader(&self, file: &TorrentFile) -> Result<Arc<dyn PieceProvider>, TorrentError> {
        let file_offset = self
            .torrent
            .file_offset(file.index)
            .ok_or(TorrentError::FileNotFound { index: file.index })?;

        Ok(Arc::new(SimulatedReader {
            torrent: self.torrent.clone(),
            file_offset,
            length: file.length,
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(info_hash = %self.info_hash, "Simulated torrent closed");
    }
}

/// Reads zero-filled bytes for whatever prefix of the torrent is downloaded.
struct SimulatedReader {
    torrent: SimulatedTorrent,
    file_offset: u64,
    length: u64,
}

#[async_trait]
impl PieceProvider for SimulatedReader {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, PieceProviderError> {
        if offset >= self.length {
            return Err(PieceProviderError::InvalidRange {
                offset,
                length,
                file_size: self.length,
            });
        }
        if self.torrent.is_broken() {
            return Err(PieceProviderError::StorageError(
                "torrent connection lost".to_string(),
            ));
        }

        let end = (offset + length as u64).min(self.length);
        if self.file_offset + end > self.torrent.completed_bytes() {
            return Err(PieceProviderError::NotYetAvailable);
        }

        Ok(Bytes::from(vec![0u8; (end - offset) as usize]))
    }

    async fn size(&self) -> u64 {
        self.length
    }
}
