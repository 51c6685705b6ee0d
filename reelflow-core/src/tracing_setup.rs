//! Tracing setup for Reelflow
//!
//! Console output follows the level chosen on the command line while a
//! per-run log file under `logs/` captures everything at TRACE. Background
//! tasks (acquisitions, reconciliation, sweeps) log far more than an operator
//! wants on a terminal, so the file is where post-mortems start.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the full-trace log, overwritten on every run.
pub const LOG_FILE_NAME: &str = "reelflow-last-run.log";

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Global tracing subscriber already installed: {reason}")]
    AlreadyInstalled { reason: String },
}

/// Installs console + file tracing and returns the log file path.
///
/// `RUST_LOG` overrides the console level when set. The file layer always
/// records TRACE with thread ids and source locations.
///
/// # Errors
///
/// - `TracingSetupError::LogFile` - Logs directory or file cannot be created
/// - `TracingSetupError::AlreadyInstalled` - A global subscriber is already set
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let log_file_path = logs_path.join(LOG_FILE_NAME);

    let log_file = create_dir_all(logs_path)
        .and_then(|()| File::create(&log_file_path))
        .map_err(|source| TracingSetupError::LogFile {
            path: log_file_path.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TracingSetupError::AlreadyInstalled {
            reason: e.to_string(),
        })?;

    tracing::info!(
        console = %console_level,
        debug_file = %log_file_path.display(),
        "Tracing initialized"
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    #[default]
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_cli_level_maps_to_tracing_level() {
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(CliLogLevel::default()), Level::INFO);
    }

    #[test]
    fn test_cli_level_parses_case_insensitively() {
        let level = CliLogLevel::from_str("DEBUG", true).unwrap();
        assert_eq!(level, CliLogLevel::Debug);
        assert!(CliLogLevel::from_str("loud", true).is_err());
    }
}
