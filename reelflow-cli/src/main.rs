//! Reelflow CLI - Command-line interface
//!
//! Runs the media pipeline as a daemon, triggers retention sweeps on demand
//! and replays simulated acquisitions for local testing.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use reelflow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "reelflow")]
#[command(about = "Media acquisition and adaptive streaming pipeline")]
struct Cli {
    /// Console log level, overridden by RUST_LOG
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full-trace log file
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.into(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
