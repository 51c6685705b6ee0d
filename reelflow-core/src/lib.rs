//! Reelflow Core - Media acquisition and adaptive streaming
//!
//! Turns a magnet link into a playable stream while the media is still
//! being fetched, transcodes containers browsers cannot play, pushes live
//! segment state to players, records watch progress and reclaims storage
//! for content nobody watches anymore.

pub mod acquisition;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod pipeline;
pub mod retention;
pub mod store;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;
pub mod watch;

// Re-export main types for convenient access
pub use acquisition::{
    AcquisitionError, Download, DownloadKey, DownloadRegistry, DownloadStatus, RegistryError,
};
pub use broadcast::{SegmentState, SegmentStateBroadcaster, StateSubscription, StreamPhase};
pub use catalog::{CatalogError, CatalogRegistry, CatalogSource, TorrentCandidate};
pub use config::ReelflowConfig;
pub use pipeline::{BackgroundTasks, MediaPipeline, MediaResponse};
pub use retention::{RetentionSweeper, SweepReport};
pub use store::{InMemoryStore, JsonFileStore, MediaStore, StoreError};
pub use streaming::{StreamingError, TranscodeGateway};
pub use torrent::{SourceLink, TorrentClient, TorrentError};

/// Errors that can surface from any Reelflow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ReelflowError {
    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Download {key} failed: {reason}")]
    DownloadFailed { key: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReelflowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ReelflowError::NotFound { .. } => "Media not found".to_string(),
            ReelflowError::DownloadFailed { reason, .. } => {
                format!("Download failed: {reason}")
            }
            ReelflowError::Registry(RegistryError::InvalidSourceLink(_))
            | ReelflowError::Torrent(TorrentError::InvalidSourceLink { .. }) => {
                "Invalid magnet link".to_string()
            }
            ReelflowError::Acquisition(e) => match e {
                AcquisitionError::MetadataTimeout { .. } => {
                    "Timed out waiting for torrent metadata".to_string()
                }
                AcquisitionError::NoVideoFileFound { .. } => {
                    "Torrent contains no playable video".to_string()
                }
                AcquisitionError::DownloadStalled { .. } => "Download stalled".to_string(),
                _ => "Download error occurred".to_string(),
            },
            ReelflowError::Streaming(StreamingError::UnsupportedFormat { format }) => {
                format!("Unsupported video format: {format}")
            }
            ReelflowError::Streaming(_) => "Streaming error occurred".to_string(),
            ReelflowError::Catalog(CatalogError::NoCandidate { quality, .. }) => {
                format!("No {quality} release available")
            }
            ReelflowError::Catalog(_) => "Catalog lookup failed".to_string(),
            ReelflowError::Configuration { .. } => "Configuration error occurred".to_string(),
            ReelflowError::Registry(_)
            | ReelflowError::Torrent(_)
            | ReelflowError::Store(_)
            | ReelflowError::Serialization(_)
            | ReelflowError::Io(_) => "Internal error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ReelflowError::NotFound { .. }
                | ReelflowError::Registry(RegistryError::InvalidSourceLink(_))
                | ReelflowError::Torrent(TorrentError::InvalidSourceLink { .. })
                | ReelflowError::Streaming(StreamingError::UnsupportedFormat { .. })
                | ReelflowError::Catalog(
                    CatalogError::UnknownSource { .. } | CatalogError::NoCandidate { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, ReelflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_link_is_user_error() {
        let error = ReelflowError::from(RegistryError::InvalidSourceLink(
            TorrentError::InvalidSourceLink {
                reason: "missing btih".to_string(),
            },
        ));

        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Invalid magnet link");
    }

    #[test]
    fn test_store_failure_is_internal() {
        let error = ReelflowError::from(StoreError::WriteRejected {
            reason: "disk full".to_string(),
        });

        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "Internal error occurred");
    }
}
