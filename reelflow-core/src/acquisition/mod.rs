//! Torrent-backed media acquisition.
//!
//! The [`DownloadRegistry`] deduplicates requests per (content, quality) and
//! hands each new acquisition to an [`AcquisitionEngine`] task. Callers get a
//! [`SharedDownload`] back immediately and observe progress through it.

pub mod download;
pub mod engine;
pub mod registry;
pub mod selection;

use std::time::Duration;

pub use download::{Download, DownloadKey, DownloadStatus, PrimaryAsset, SharedDownload};
pub use engine::{AcquisitionEngine, Completion};
pub use registry::{DownloadRegistry, RegistryError};
pub use selection::{AssetSelection, boosted_piece_ranges, select_assets};

use crate::torrent::{InfoHash, TorrentError};

/// Reasons an acquisition ends without completing.
///
/// None of these are retried automatically; a later request for the same
/// key starts a fresh acquisition.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("metadata timeout after {timeout:?}")]
    MetadataTimeout { timeout: Duration },

    #[error("no video file found among {file_count} files")]
    NoVideoFileFound { file_count: usize },

    #[error("download stalled at {progress:.1}% after {polls} unchanged polls")]
    DownloadStalled { polls: u32, progress: f64 },

    #[error("torrent {info_hash} closed unexpectedly")]
    TorrentClosedUnexpectedly { info_hash: InfoHash },

    #[error("acquisition cancelled")]
    Cancelled,

    #[error(transparent)]
    Torrent(#[from] TorrentError),
}

pub type AcquisitionResult<T> = Result<T, AcquisitionError>;
