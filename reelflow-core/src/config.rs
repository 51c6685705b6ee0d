//! Centralized configuration for Reelflow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Reelflow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ReelflowConfig {
    pub acquisition: AcquisitionConfig,
    pub transcode: TranscodeConfig,
    pub watch: WatchConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
}

/// Acquisition engine configuration.
///
/// Controls metadata timeouts, progress polling, streaming readiness and
/// stall detection for in-flight downloads.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Maximum wait for the torrent file list
    pub metadata_timeout: Duration,
    /// Interval between progress polls
    pub poll_interval: Duration,
    /// Bytes on disk before the primary asset may be streamed
    pub streaming_threshold_bytes: u64,
    /// Consecutive unchanged polls before a download counts as stalled
    pub stall_poll_limit: u32,
    /// Stall detection only fires below this progress percentage
    pub stall_progress_floor: f64,
    /// Fraction of pieces boosted at the head and at the tail of the asset
    pub boosted_piece_fraction: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            streaming_threshold_bytes: 5 * 1024 * 1024, // 5 MiB
            stall_poll_limit: 150,                      // 5 minutes at 2s polls
            stall_progress_floor: 5.0,
            boosted_piece_fraction: 0.10,
        }
    }
}

/// External transcoder configuration.
///
/// The transcoder is invoked as `program args...` where the `{input}`
/// placeholder is replaced with the source path (or `pipe:0` when the
/// source is fed through stdin). Output is read from stdout.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Transcoder executable
    pub program: String,
    /// Argument template
    pub args: Vec<String>,
    /// Content type announced for transcoded output
    pub output_content_type: &'static str,
    /// Read size for stdout and for the stdin pump
    pub chunk_size: usize,
}

/// Placeholder replaced with the transcoder input in [`TranscodeConfig::args`].
pub const TRANSCODE_INPUT_PLACEHOLDER: &str = "{input}";

impl Default for TranscodeConfig {
    fn default() -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            TRANSCODE_INPUT_PLACEHOLDER,
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-f",
            "mp4",
            "pipe:1",
        ];

        Self {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            output_content_type: "video/mp4",
            chunk_size: 256 * 1024, // 256 KiB
        }
    }
}

/// Watch-progress reconciliation configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Interval between reconciliation ticks
    pub reconcile_interval: Duration,
    /// Pattern whose first capture group is the numeric segment index
    pub segment_index_pattern: String,
    /// Playlist file name inside each per-content stream directory
    pub playlist_name: String,
    /// Number of terminal segments kept in memory
    pub terminal_cache_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            segment_index_pattern: r"(\d+)\.ts$".to_string(),
            playlist_name: "index.m3u8".to_string(),
            terminal_cache_capacity: 512,
        }
    }
}

/// Retention sweep configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Content unwatched for longer than this is reclaimed
    pub retention_window: Duration,
    /// Interval between acquired-media sweeps
    pub media_sweep_interval: Duration,
    /// Interval between derived-stream sweeps
    pub stream_sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(30 * 24 * 3600), // one month
            media_sweep_interval: Duration::from_secs(24 * 3600),
            stream_sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Where the torrent engine writes acquired files
    pub download_dir: PathBuf,
    /// Root of the per-content derived stream directories
    pub streams_dir: PathBuf,
    /// Durable store snapshot file
    pub store_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("data/downloads"),
            streams_dir: PathBuf::from("data/streams"),
            store_path: PathBuf::from("data/reelflow-store.json"),
        }
    }
}

impl ReelflowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_u64("REELFLOW_METADATA_TIMEOUT_SECS") {
            config.acquisition.metadata_timeout = Duration::from_secs(seconds);
        }

        if let Some(bytes) = env_u64("REELFLOW_STREAMING_THRESHOLD_BYTES") {
            config.acquisition.streaming_threshold_bytes = bytes;
        }

        if let Some(polls) = env_u64("REELFLOW_STALL_POLLS") {
            config.acquisition.stall_poll_limit = polls.min(u32::MAX as u64) as u32;
        }

        if let Ok(program) = std::env::var("REELFLOW_TRANSCODER") {
            if !program.is_empty() {
                config.transcode.program = program;
            }
        }

        if let Some(days) = env_u64("REELFLOW_RETENTION_DAYS") {
            config.retention.retention_window = days_to_duration(days);
        }

        if let Ok(dir) = std::env::var("REELFLOW_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("REELFLOW_STREAMS_DIR") {
            config.storage.streams_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("REELFLOW_STORE_PATH") {
            config.storage.store_path = PathBuf::from(path);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Every interval shrinks to milliseconds so lifecycle tests finish fast.
    pub fn for_testing() -> Self {
        Self {
            acquisition: AcquisitionConfig {
                metadata_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                stall_poll_limit: 5,
                ..Default::default()
            },
            watch: WatchConfig {
                reconcile_interval: Duration::from_millis(20),
                ..Default::default()
            },
            retention: RetentionConfig {
                media_sweep_interval: Duration::from_millis(50),
                stream_sweep_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Whole days as a duration, clamped instead of overflowing.
fn days_to_duration(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 3600))
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse::<u64>().ok()
}
