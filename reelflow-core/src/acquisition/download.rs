//! In-flight download records.
//!
//! A [`SharedDownload`] is written by exactly one acquisition task and read
//! by any number of request handlers. Readers take [`Download`] snapshots;
//! the task mutates through crate-private transitions that keep progress
//! monotonic and never leave a terminal status.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::AcquiredMedia;
use crate::streaming::PieceProvider;

/// Identifies one acquisition: a content item at a given quality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadKey {
    pub content_id: i64,
    pub quality: String,
}

impl DownloadKey {
    pub fn new(content_id: i64, quality: impl Into<String>) -> Self {
        Self {
            content_id,
            quality: quality.into(),
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_id, self.quality)
    }
}

/// Lifecycle of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for torrent metadata
    Initializing,
    /// Primary asset selected, fetching data
    Downloading,
    /// Enough data on disk to start playback
    Streaming,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Point-in-time view of a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub content_id: i64,
    pub quality: String,
    pub status: DownloadStatus,
    /// Percentage in `0.0..=100.0`
    pub progress: f64,
    pub streaming_ready: bool,
    pub file_path: Option<PathBuf>,
    pub subtitle_path: Option<PathBuf>,
    pub source_link: String,
    pub bytes_completed: u64,
    pub total_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Download {
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(self.content_id, self.quality.clone())
    }
}

/// The torrent file chosen for playback, readable while it downloads.
#[derive(Clone)]
pub struct PrimaryAsset {
    pub file_name: String,
    pub length: u64,
    pub reader: Arc<dyn PieceProvider>,
}

impl fmt::Debug for PrimaryAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryAsset")
            .field("file_name", &self.file_name)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

struct DownloadCell {
    key: DownloadKey,
    state: RwLock<Download>,
    asset: OnceLock<PrimaryAsset>,
}

/// Shared handle to a download record.
#[derive(Clone)]
pub struct SharedDownload {
    inner: Arc<DownloadCell>,
}

impl fmt::Debug for SharedDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDownload")
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

impl SharedDownload {
    /// Creates a record in `Initializing` state.
    pub fn new(key: DownloadKey, source_link: impl Into<String>) -> Self {
        let download = Download {
            content_id: key.content_id,
            quality: key.quality.clone(),
            status: DownloadStatus::Initializing,
            progress: 0.0,
            streaming_ready: false,
            file_path: None,
            subtitle_path: None,
            source_link: source_link.into(),
            bytes_completed: 0,
            total_bytes: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };

        Self::from_download(key, download)
    }

    /// Creates a completed record for media that is already on disk.
    pub fn from_acquired(media: &AcquiredMedia) -> Self {
        let download = Download {
            content_id: media.content_id,
            quality: media.quality.clone(),
            status: DownloadStatus::Completed,
            progress: 100.0,
            streaming_ready: true,
            file_path: Some(media.file_path.clone()),
            subtitle_path: None,
            source_link: media.source_link.clone(),
            bytes_completed: media.file_size_bytes,
            total_bytes: media.file_size_bytes,
            started_at: media.acquired_at,
            completed_at: Some(media.acquired_at),
            error: None,
        };

        Self::from_download(media.key(), download)
    }

    fn from_download(key: DownloadKey, download: Download) -> Self {
        Self {
            inner: Arc::new(DownloadCell {
                key,
                state: RwLock::new(download),
                asset: OnceLock::new(),
            }),
        }
    }

    pub fn key(&self) -> &DownloadKey {
        &self.inner.key
    }

    pub fn snapshot(&self) -> Download {
        self.inner.state.read().clone()
    }

    pub fn status(&self) -> DownloadStatus {
        self.inner.state.read().status
    }

    pub fn is_streaming_ready(&self) -> bool {
        self.inner.state.read().streaming_ready
    }

    /// Reader over the selected file, once metadata has been resolved.
    pub fn primary_asset(&self) -> Option<&PrimaryAsset> {
        self.inner.asset.get()
    }

    /// True when both handles point at the same record.
    pub fn same_record(&self, other: &SharedDownload) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_primary_asset(&self, asset: PrimaryAsset) {
        let _ = self.inner.asset.set(asset);
    }

    pub(crate) fn mark_downloading(
        &self,
        file_path: PathBuf,
        subtitle_path: Option<PathBuf>,
        total_bytes: u64,
    ) {
        let mut state = self.inner.state.write();
        if state.status.is_terminal() {
            return;
        }
        state.status = DownloadStatus::Downloading;
        state.file_path = Some(file_path);
        state.subtitle_path = subtitle_path;
        state.total_bytes = total_bytes;
    }

    /// Records a progress poll and returns the resulting percentage.
    ///
    /// Progress never moves backwards even if the engine reports fewer bytes.
    pub(crate) fn record_progress(&self, bytes_completed: u64, total_bytes: u64) -> f64 {
        let mut state = self.inner.state.write();
        if state.status.is_terminal() {
            return state.progress;
        }

        let percent = if total_bytes == 0 {
            0.0
        } else {
            (bytes_completed as f64 / total_bytes as f64 * 100.0).clamp(0.0, 100.0)
        };

        state.progress = state.progress.max(percent);
        state.bytes_completed = state.bytes_completed.max(bytes_completed);
        state.total_bytes = total_bytes;
        state.progress
    }

    /// Flags the download as playable. Returns true on the first call only.
    pub(crate) fn mark_streaming_ready(&self) -> bool {
        let mut state = self.inner.state.write();
        if state.streaming_ready || state.status.is_terminal() {
            return false;
        }
        state.streaming_ready = true;
        state.status = DownloadStatus::Streaming;
        true
    }

    pub(crate) fn mark_completed(&self, at: DateTime<Utc>) {
        let mut state = self.inner.state.write();
        if state.status.is_terminal() {
            return;
        }
        state.status = DownloadStatus::Completed;
        state.progress = 100.0;
        state.streaming_ready = true;
        state.bytes_completed = state.total_bytes;
        state.completed_at = Some(at);
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        let mut state = self.inner.state.write();
        if state.status.is_terminal() {
            return;
        }
        state.status = DownloadStatus::Error;
        state.error = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download() -> SharedDownload {
        SharedDownload::new(DownloadKey::new(42, "720p"), "magnet:?xt=urn:btih:00")
    }

    #[test]
    fn test_progress_is_monotonic() {
        let download = download();

        assert_eq!(download.record_progress(50, 100), 50.0);
        assert_eq!(download.record_progress(30, 100), 50.0);
        assert_eq!(download.record_progress(75, 100), 75.0);
        assert_eq!(download.snapshot().bytes_completed, 75);
    }

    #[test]
    fn test_streaming_ready_is_set_once() {
        let download = download();
        download.mark_downloading(PathBuf::from("/tmp/movie.mkv"), None, 100);

        assert!(download.mark_streaming_ready());
        assert!(!download.mark_streaming_ready());
        assert_eq!(download.status(), DownloadStatus::Streaming);
        assert!(download.is_streaming_ready());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let download = download();
        download.mark_failed("download stalled");
        download.mark_completed(Utc::now());
        download.mark_downloading(PathBuf::from("/tmp/movie.mkv"), None, 100);

        let snapshot = download.snapshot();
        assert_eq!(snapshot.status, DownloadStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("download stalled"));
        assert!(snapshot.completed_at.is_none());
    }

    #[test]
    fn test_completion_sets_full_progress() {
        let download = download();
        download.mark_downloading(PathBuf::from("/tmp/movie.mkv"), None, 100);
        download.record_progress(40, 100);
        download.mark_completed(Utc::now());

        let snapshot = download.snapshot();
        assert_eq!(snapshot.status, DownloadStatus::Completed);
        assert_eq!(snapshot.progress, 100.0);
        assert!(snapshot.streaming_ready);
        assert!(snapshot.completed_at.is_some());
    }

    #[test]
    fn test_snapshot_serializes_lowercase_status() {
        let download = download();
        let json = serde_json::to_value(download.snapshot()).unwrap();

        assert_eq!(json["status"], "initializing");
        assert_eq!(json["content_id"], 42);
    }

    #[test]
    fn test_same_record_distinguishes_instances() {
        let first = download();
        let second = download();

        assert!(first.same_record(&first.clone()));
        assert!(!first.same_record(&second));
    }
}
