//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use reelflow_core::config::ReelflowConfig;
use reelflow_core::store::{InMemoryStore, JsonFileStore, MediaStore};
use reelflow_core::torrent::{SimulatedTorrent, SimulatedTorrentClient, SourceLink};
use reelflow_core::watch::TerminalSegmentCache;
use reelflow_core::{DownloadStatus, MediaPipeline, RetentionSweeper};
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the watch tracker and retention sweeps until interrupted
    ///
    /// The daemon only reconciles and sweeps. It is wired to the simulated
    /// torrent engine and cannot start real acquisitions.
    Daemon,
    /// Run both retention sweeps once and report what was removed
    Sweep,
    /// List acquired media recorded in the store
    Media,
    /// Acquire a scripted torrent and print its status transitions
    Simulate {
        /// Content id to acquire
        #[arg(long, default_value = "42")]
        content_id: i64,
        /// Quality label of the release
        #[arg(long, default_value = "720p")]
        quality: String,
        /// Size of the simulated video file in MiB
        #[arg(long, default_value = "50")]
        size_mib: u64,
        /// Simulated download rate in MiB per second
        #[arg(long, default_value = "10")]
        rate_mib: u64,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever command fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = ReelflowConfig::from_env();

    match command {
        Commands::Daemon => run_daemon(config).await,
        Commands::Sweep => run_sweep(config).await,
        Commands::Media => list_media(config).await,
        Commands::Simulate {
            content_id,
            quality,
            size_mib,
            rate_mib,
        } => run_simulation(config, content_id, &quality, size_mib, rate_mib).await,
    }
}

async fn open_store(config: &ReelflowConfig) -> anyhow::Result<Arc<dyn MediaStore>> {
    let store = JsonFileStore::open(&config.storage.store_path)
        .await
        .with_context(|| format!("opening store {}", config.storage.store_path.display()))?;
    Ok(Arc::new(store))
}

fn build_pipeline(
    config: ReelflowConfig,
    client: Arc<SimulatedTorrentClient>,
    store: Arc<dyn MediaStore>,
) -> anyhow::Result<MediaPipeline> {
    Ok(MediaPipeline::new(config, client, store)?)
}

/// Runs the periodic tasks until Ctrl-C, then shuts them down.
///
/// Nothing in this process requests acquisitions, so the pipeline is backed
/// by an empty simulated engine. Any acquisition attempt would be rejected
/// as an unregistered source.
///
/// # Errors
/// - Store cannot be opened or the pipeline configuration is invalid
pub async fn run_daemon(config: ReelflowConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let client = Arc::new(SimulatedTorrentClient::new(
        config.storage.download_dir.clone(),
    ));
    let pipeline = build_pipeline(config, client, store)?;
    info!("Torrent engine: simulated, no sources registered");

    let tasks = pipeline.start_background_tasks();
    println!("Reelflow daemon running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutdown requested");
    tasks.shutdown().await;
    println!("Reelflow daemon stopped");
    Ok(())
}

/// Runs both sweeps once against the configured store.
///
/// # Errors
/// - Store cannot be opened
pub async fn run_sweep(config: ReelflowConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let terminals = Arc::new(TerminalSegmentCache::new(
        config.storage.streams_dir.clone(),
        config.watch.playlist_name.clone(),
        config.watch.terminal_cache_capacity,
    ));
    let sweeper = RetentionSweeper::new(store, terminals, config.retention);

    let now = Utc::now();
    let media = sweeper.sweep_acquired_media(now).await;
    let streams = sweeper.sweep_derived_streams(now).await;

    println!(
        "Acquired media: {} removed, {} retained, {} failed",
        media.removed, media.skipped, media.failures
    );
    println!(
        "Derived streams: {} removed, {} retained, {} failed",
        streams.removed, streams.skipped, streams.failures
    );
    Ok(())
}

/// Prints every acquired media row.
///
/// # Errors
/// - Store cannot be opened or read
pub async fn list_media(config: ReelflowConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let media = store.list_acquired_media().await?;

    if media.is_empty() {
        println!("No acquired media");
        return Ok(());
    }

    for row in media {
        println!(
            "{:>8}  {:<6}  {:>12} bytes  last access {}  {}",
            row.content_id,
            row.quality,
            row.file_size_bytes,
            row.last_accessed_at.format("%Y-%m-%d %H:%M"),
            row.file_path.display()
        );
    }
    Ok(())
}

/// Acquires a scripted torrent with an in-memory store and follows it to
/// a terminal status.
///
/// # Errors
/// - The acquisition could not start or its status could not be read
pub async fn run_simulation(
    config: ReelflowConfig,
    content_id: i64,
    quality: &str,
    size_mib: u64,
    rate_mib: u64,
) -> anyhow::Result<()> {
    let link = format!("magnet:?xt=urn:btih:{content_id:040x}&dn=simulated-{content_id}");
    let source = SourceLink::parse(&link)?;

    let client = Arc::new(SimulatedTorrentClient::new(
        config.storage.download_dir.clone(),
    ));
    let torrent = SimulatedTorrent::new([
        (format!("simulated-{content_id}/movie.mp4"), size_mib * 1024 * 1024),
        (format!("simulated-{content_id}/movie.en.srt"), 64 * 1024),
    ])
    .with_download_rate(rate_mib * 1024 * 1024);
    client.register(&source, torrent.clone());

    let pipeline = build_pipeline(config, client, Arc::new(InMemoryStore::new()))?;
    let download = pipeline
        .registry()
        .get_or_start(content_id, quality, &link)
        .await?;
    println!("Started {} ({:?})", download.key(), download.status());
    torrent.release_metadata();

    let mut last = (download.status(), download.is_streaming_ready());
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let snapshot = download.snapshot();
        let current = (snapshot.status, snapshot.streaming_ready);

        if current != last {
            let ready = if snapshot.streaming_ready {
                ", streaming ready"
            } else {
                ""
            };
            println!("{:>6.1}%  {:?}{ready}", snapshot.progress, snapshot.status);
            last = current;
        }

        match snapshot.status {
            DownloadStatus::Error => {
                println!("Failed: {}", snapshot.error.unwrap_or_default());
                break;
            }
            DownloadStatus::Completed => {
                if let Some(path) = snapshot.file_path {
                    println!("Completed: {}", path.display());
                }
                break;
            }
            _ => {}
        }
    }

    pipeline.registry().shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use reelflow_core::store::AcquiredMedia;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_sweep_runs_without_torrent_engine() {
        let dir = tempdir().unwrap();
        let mut config = ReelflowConfig::default();
        config.storage.store_path = dir.path().join("store.json");
        config.storage.streams_dir = dir.path().join("streams");
        config.storage.download_dir = dir.path().join("downloads");

        let media_path = dir.path().join("old.mp4");
        std::fs::write(&media_path, b"stale").unwrap();
        let long_ago = Utc::now() - ChronoDuration::days(90);

        let store = JsonFileStore::open(&config.storage.store_path).await.unwrap();
        store
            .upsert_acquired_media(AcquiredMedia {
                content_id: 5,
                quality: "1080p".to_string(),
                file_path: media_path.clone(),
                source_link: "magnet:?xt=urn:btih:0000000000000000000000000000000000000005"
                    .to_string(),
                acquired_at: long_ago,
                last_accessed_at: long_ago,
                file_size_bytes: 5,
            })
            .await
            .unwrap();
        drop(store);

        run_sweep(config.clone()).await.unwrap();

        assert!(!media_path.exists());
        let store = JsonFileStore::open(&config.storage.store_path).await.unwrap();
        assert!(store.list_acquired_media().await.unwrap().is_empty());
    }
}
