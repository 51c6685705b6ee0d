//! Seam over the external torrent engine.
//!
//! Reelflow does not speak the BitTorrent wire protocol itself. Acquisition
//! drives any engine that offers file-list metadata, per-piece priority
//! hints, completion counters and random access to a file being fetched.

pub mod simulated;
pub mod source;

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
pub use simulated::{SimulatedTorrent, SimulatedTorrentClient};
pub use source::SourceLink;

use crate::streaming::PieceProvider;

/// SHA-1 hash identifying a unique torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One file inside a torrent, as listed by its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Position in the torrent's file list
    pub index: usize,
    /// Path relative to the torrent root
    pub path: PathBuf,
    /// Size in bytes
    pub length: u64,
    /// Pieces overlapping this file
    pub pieces: Range<u32>,
}

impl TorrentFile {
    /// Lowercased extension, if any.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Final path component as a string.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Download priority hint handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadPriority {
    /// Regular sequential fetching
    Normal,
    /// Fetch before normal pieces
    High,
}

/// Adds sources to the underlying torrent engine.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Adds a source link and returns a handle for monitoring it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Engine` - The engine rejected the source
    async fn add_source(&self, link: &SourceLink) -> Result<Arc<dyn TorrentHandle>, TorrentError>;
}

/// A single torrent owned by the engine.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Info hash of this torrent.
    fn info_hash(&self) -> InfoHash;

    /// Blocks until the file list is known. Callers impose their own timeout.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The torrent was dropped by the engine
    async fn wait_for_metadata(&self) -> Result<(), TorrentError>;

    /// Lists files. Only meaningful after metadata is available.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataUnavailable` - Called before metadata arrived
    fn files(&self) -> Result<Vec<TorrentFile>, TorrentError>;

    /// Sets the priority of a whole file, signalling intent to fetch it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::FileNotFound` - Index outside the file list
    async fn set_file_priority(
        &self,
        index: usize,
        priority: DownloadPriority,
    ) -> Result<(), TorrentError>;

    /// Sets the priority of a contiguous piece range.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The torrent was dropped by the engine
    async fn set_piece_priority(
        &self,
        pieces: Range<u32>,
        priority: DownloadPriority,
    ) -> Result<(), TorrentError>;

    /// Bytes verified and written so far.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The torrent was dropped by the engine
    fn bytes_completed(&self) -> Result<u64, TorrentError>;

    /// Bytes of `file` verified and written so far.
    ///
    /// # Errors
    ///
    /// - `TorrentError::HandleClosed` - The torrent was dropped by the engine
    /// - `TorrentError::FileNotFound` - File is not part of this torrent
    fn file_bytes_completed(&self, file: &TorrentFile) -> Result<u64, TorrentError>;

    /// Total bytes in the torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataUnavailable` - Called before metadata arrived
    fn total_length(&self) -> Result<u64, TorrentError>;

    /// Where the engine writes `file` on disk.
    fn local_path(&self, file: &TorrentFile) -> PathBuf;

    /// Random-access reader over `file` that works while it is downloading.
    ///
    /// # Errors
    ///
    /// - `TorrentError::FileNotFound` - File is not part of this torrent
    fn reader(&self, file: &TorrentFile) -> Result<Arc<dyn PieceProvider>, TorrentError>;

    /// Releases the torrent. Files already on disk stay where they are.
    async fn close(&self);
}

/// Errors reported by the torrent engine seam.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid source link: {reason}")]
    InvalidSourceLink { reason: String },

    #[error("Torrent metadata not available yet")]
    MetadataUnavailable,

    #[error("Torrent {info_hash} handle closed")]
    HandleClosed { info_hash: InfoHash },

    #[error("File {index} not found in torrent")]
    FileNotFound { index: usize },

    #[error("Torrent engine error: {reason}")]
    Engine { reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TorrentError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_torrent_file_extension_is_lowercased() {
        let file = TorrentFile {
            index: 0,
            path: PathBuf::from("Movie (2010)/Movie.MKV"),
            length: 10,
            pieces: 0..1,
        };

        assert_eq!(file.extension().as_deref(), Some("mkv"));
        assert_eq!(file.file_name(), "Movie.MKV");
    }
}
