//! Background acquisition of a single source.
//!
//! One task per download drives the torrent handle from metadata through
//! completion, writing every observable change into the shared record.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::download::{PrimaryAsset, SharedDownload};
use super::selection::{AssetSelection, boosted_piece_ranges, select_assets};
use super::{AcquisitionError, AcquisitionResult};
use crate::config::AcquisitionConfig;
use crate::store::{AcquiredMedia, MediaStore};
use crate::torrent::{
    DownloadPriority, SourceLink, TorrentClient, TorrentError, TorrentFile, TorrentHandle,
};

/// Result of an acquisition that reached completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub media: AcquiredMedia,
    /// Whether the `AcquiredMedia` row was written
    pub persisted: bool,
}

/// Runs acquisitions against a torrent client and records the results.
#[derive(Clone)]
pub struct AcquisitionEngine {
    config: AcquisitionConfig,
    client: Arc<dyn TorrentClient>,
    store: Arc<dyn MediaStore>,
}

impl AcquisitionEngine {
    pub fn new(
        config: AcquisitionConfig,
        client: Arc<dyn TorrentClient>,
        store: Arc<dyn MediaStore>,
    ) -> Self {
        Self {
            config,
            client,
            store,
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Acquires `source` into `download` until completion, failure or cancellation.
    ///
    /// The torrent handle is closed on every exit path. Completed files stay
    /// on disk.
    ///
    /// # Errors
    ///
    /// - `AcquisitionError::MetadataTimeout` - File list did not arrive in time
    /// - `AcquisitionError::NoVideoFileFound` - Torrent has no playable file
    /// - `AcquisitionError::DownloadStalled` - Progress stopped below the floor
    /// - `AcquisitionError::TorrentClosedUnexpectedly` - Engine dropped the torrent
    /// - `AcquisitionError::Cancelled` - Shutdown was requested
    pub async fn run(
        &self,
        download: &SharedDownload,
        source: &SourceLink,
        cancel: CancellationToken,
    ) -> AcquisitionResult<Completion> {
        let handle = self.client.add_source(source).await?;
        info!(key = %download.key(), info_hash = %handle.info_hash(), "Acquisition started");

        let result = self.drive(handle.as_ref(), download, source, &cancel).await;
        handle.close().await;
        result
    }

    async fn drive(
        &self,
        handle: &dyn TorrentHandle,
        download: &SharedDownload,
        source: &SourceLink,
        cancel: &CancellationToken,
    ) -> AcquisitionResult<Completion> {
        self.await_metadata(handle, cancel).await?;

        let files = handle.files()?;
        let AssetSelection { primary, subtitle } =
            select_assets(&files).ok_or(AcquisitionError::NoVideoFileFound {
                file_count: files.len(),
            })?;

        info!(
            key = %download.key(),
            file = %primary.path.display(),
            bytes = primary.length,
            subtitle = ?subtitle.as_ref().map(|sub| sub.path.display().to_string()),
            "Primary asset selected"
        );

        handle
            .set_file_priority(primary.index, DownloadPriority::Normal)
            .await
            .map_err(|e| closed_or(handle, e))?;
        if let Some(subtitle) = &subtitle {
            handle
                .set_file_priority(subtitle.index, DownloadPriority::Normal)
                .await
                .map_err(|e| closed_or(handle, e))?;
        }

        let (head, tail) = boosted_piece_ranges(&primary.pieces, self.config.boosted_piece_fraction);
        for range in [head, tail].into_iter().filter(|range| !range.is_empty()) {
            handle
                .set_piece_priority(range, DownloadPriority::High)
                .await
                .map_err(|e| closed_or(handle, e))?;
        }

        download.set_primary_asset(PrimaryAsset {
            file_name: primary.file_name(),
            length: primary.length,
            reader: handle.reader(&primary)?,
        });

        let total_bytes = handle.total_length()?;
        let file_path = handle.local_path(&primary);
        download.mark_downloading(
            file_path.clone(),
            subtitle.as_ref().map(|sub| handle.local_path(sub)),
            total_bytes,
        );

        self.poll_until_complete(handle, download, total_bytes, &primary, cancel)
            .await?;

        let now = Utc::now();
        download.mark_completed(now);

        let media = AcquiredMedia {
            content_id: download.key().content_id,
            quality: download.key().quality.clone(),
            file_path,
            source_link: source.as_str().to_string(),
            acquired_at: now,
            last_accessed_at: now,
            file_size_bytes: primary.length,
        };

        let persisted = match self.store.upsert_acquired_media(media.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %download.key(), "Failed to record acquired media: {e}");
                false
            }
        };

        info!(key = %download.key(), bytes = total_bytes, "Acquisition completed");
        Ok(Completion { media, persisted })
    }

    async fn await_metadata(
        &self,
        handle: &dyn TorrentHandle,
        cancel: &CancellationToken,
    ) -> AcquisitionResult<()> {
        let wait = timeout(self.config.metadata_timeout, handle.wait_for_metadata());

        tokio::select! {
            _ = cancel.cancelled() => Err(AcquisitionError::Cancelled),
            result = wait => match result {
                Err(_) => Err(AcquisitionError::MetadataTimeout {
                    timeout: self.config.metadata_timeout,
                }),
                Ok(Err(e)) => Err(closed_or(handle, e)),
                Ok(Ok(())) => Ok(()),
            },
        }
    }

    async fn poll_until_complete(
        &self,
        handle: &dyn TorrentHandle,
        download: &SharedDownload,
        total_bytes: u64,
        primary: &TorrentFile,
        cancel: &CancellationToken,
    ) -> AcquisitionResult<()> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Readiness counts bytes of the primary asset, not of the torrent
        let ready_at = self.config.streaming_threshold_bytes.min(primary.length);

        let mut last_bytes: Option<u64> = None;
        let mut unchanged_polls: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquisitionError::Cancelled),
                _ = ticker.tick() => {}
            }

            let bytes = handle.bytes_completed().map_err(|e| closed_or(handle, e))?;
            let progress = download.record_progress(bytes, total_bytes);

            if !download.is_streaming_ready() {
                let asset_bytes = handle
                    .file_bytes_completed(primary)
                    .map_err(|e| closed_or(handle, e))?;

                if asset_bytes >= ready_at && download.mark_streaming_ready() {
                    info!(key = %download.key(), asset_bytes, "Primary asset ready for streaming");
                    // Head and tail are on disk; let the rest fetch in order
                    handle
                        .set_piece_priority(primary.pieces.clone(), DownloadPriority::Normal)
                        .await
                        .map_err(|e| closed_or(handle, e))?;
                }
            }

            if bytes >= total_bytes {
                return Ok(());
            }

            if last_bytes == Some(bytes) {
                unchanged_polls += 1;
            } else {
                unchanged_polls = 0;
                last_bytes = Some(bytes);
            }

            debug!(key = %download.key(), bytes, progress, unchanged_polls, "Progress poll");

            if unchanged_polls >= self.config.stall_poll_limit
                && progress < self.config.stall_progress_floor
            {
                return Err(AcquisitionError::DownloadStalled {
                    polls: unchanged_polls,
                    progress,
                });
            }
        }
    }
}

fn closed_or(handle: &dyn TorrentHandle, error: TorrentError) -> AcquisitionError {
    match error {
        TorrentError::HandleClosed { .. } => AcquisitionError::TorrentClosedUnexpectedly {
            info_hash: handle.info_hash(),
        },
        other => AcquisitionError::Torrent(other),
    }
}
