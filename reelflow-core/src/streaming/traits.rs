//! Random-access reading over media that may still be downloading.

use bytes::Bytes;
use thiserror::Error;

/// Provides a file-like async interface over a file being fetched.
///
/// Torrent pieces arrive out of order; implementations hide that behind a
/// linear byte-range read. Completed files on disk use the same interface
/// so the pass-through path does not care where bytes come from.
#[async_trait::async_trait]
pub trait PieceProvider: Send + Sync {
    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Short reads happen only at end of file.
    ///
    /// # Errors
    ///
    /// - `PieceProviderError::NotYetAvailable` - Required pieces are not yet downloaded
    /// - `PieceProviderError::StorageError` - Underlying storage operation failed
    /// - `PieceProviderError::InvalidRange` - Offset is past the end of the file
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, PieceProviderError>;

    /// Returns the total size of the logical file in bytes.
    async fn size(&self) -> u64;
}

/// Errors that can occur when reading from a piece provider.
#[derive(Debug, Error)]
pub enum PieceProviderError {
    /// The requested pieces are not yet available for reading.
    ///
    /// Transient: callers retry after a short delay.
    #[error("requested pieces not yet available")]
    NotYetAvailable,

    /// An error occurred in the underlying storage system.
    #[error("storage error: {0}")]
    StorageError(String),

    /// The requested offset lies beyond the file.
    #[error("invalid range: offset {offset} + length {length} exceeds file size {file_size}")]
    InvalidRange {
        /// The requested starting offset.
        offset: u64,
        /// The requested read length.
        length: usize,
        /// The actual file size.
        file_size: u64,
    },
}
