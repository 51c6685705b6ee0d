//! Media delivery: pass-through byte ranges and on-demand transcoding.
//!
//! Completed files and torrents that are still downloading are both read
//! through [`PieceProvider`], so the same response builders serve either.

pub mod direct_stream;
pub mod file_provider;
pub mod gateway;
pub mod media_format;
pub mod range;
pub mod traits;
pub mod transcode_stream;

use std::path::PathBuf;

pub use direct_stream::passthrough_response;
pub use file_provider::FileProvider;
pub use gateway::TranscodeGateway;
pub use media_format::{ContainerClass, classify};
pub use range::{ByteRange, RangeRequest, resolve_range};
use thiserror::Error;
pub use traits::{PieceProvider, PieceProviderError};
pub use transcode_stream::{TranscodeInput, transcode_response};

/// Errors that can occur while serving media.
#[derive(Debug, Error)]
pub enum StreamingError {
    /// The requested file is not on disk.
    #[error("Media file not found: {path}")]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Container format is not supported for streaming.
    #[error("Container format not supported: {format}")]
    UnsupportedFormat {
        /// Extension of the unsupported container.
        format: String,
    },

    /// The external transcoder could not be run.
    #[error("Transcoder failure: {reason}")]
    TranscoderFailure {
        /// What went wrong with the process.
        reason: String,
    },

    /// I/O error occurred during a specific operation.
    #[error("IO error during {operation}: {source}")]
    Io {
        /// Description of the operation that failed.
        operation: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for streaming operations.
pub type StreamingResult<T> = Result<T, StreamingError>;
