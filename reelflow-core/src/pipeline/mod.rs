//! Facade wiring acquisition, delivery, state fan-out and watch tracking.
//!
//! The outer web layer talks only to [`MediaPipeline`]. Every component is
//! owned by the pipeline instance, so tests can build isolated pipelines.

pub mod tasks;

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use tasks::BackgroundTasks;

use crate::acquisition::{
    AcquisitionEngine, Download, DownloadKey, DownloadRegistry, DownloadStatus, SharedDownload,
};
use crate::broadcast::{SegmentState, SegmentStateBroadcaster, StateSubscription};
use crate::catalog::CatalogRegistry;
use crate::config::ReelflowConfig;
use crate::retention::RetentionSweeper;
use crate::store::MediaStore;
use crate::streaming::{StreamingError, TranscodeGateway};
use crate::torrent::TorrentClient;
use crate::watch::{SegmentIndexPattern, SegmentVisits, TerminalSegmentCache, WatchProgressTracker};
use crate::{ReelflowError, Result};

/// Outcome of a media request that did not fail.
pub enum MediaResponse {
    /// Bytes are flowing
    Stream(Response),
    /// The download exists but is not playable yet
    Processing(Download),
}

impl fmt::Debug for MediaResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaResponse::Stream(response) => f
                .debug_tuple("Stream")
                .field(&response.status())
                .finish(),
            MediaResponse::Processing(download) => {
                f.debug_tuple("Processing").field(download).finish()
            }
        }
    }
}

/// The media acquisition and streaming pipeline.
pub struct MediaPipeline {
    config: ReelflowConfig,
    store: Arc<dyn MediaStore>,
    registry: DownloadRegistry,
    gateway: TranscodeGateway,
    broadcaster: SegmentStateBroadcaster,
    visits: Arc<SegmentVisits>,
    terminals: Arc<TerminalSegmentCache>,
    tracker: Arc<WatchProgressTracker>,
    sweeper: Arc<RetentionSweeper>,
    catalogs: CatalogRegistry,
}

impl MediaPipeline {
    /// Builds a pipeline around `client` and `store`.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::Configuration` - The segment index pattern does not compile
    pub fn new(
        config: ReelflowConfig,
        client: Arc<dyn TorrentClient>,
        store: Arc<dyn MediaStore>,
    ) -> Result<Self> {
        let pattern = SegmentIndexPattern::new(&config.watch.segment_index_pattern).map_err(
            |e| ReelflowError::Configuration {
                reason: format!("invalid segment index pattern: {e}"),
            },
        )?;

        let engine = AcquisitionEngine::new(config.acquisition.clone(), client, store.clone());
        let registry = DownloadRegistry::new(engine, store.clone());
        let visits = Arc::new(SegmentVisits::new());
        let terminals = Arc::new(TerminalSegmentCache::new(
            config.storage.streams_dir.clone(),
            config.watch.playlist_name.clone(),
            config.watch.terminal_cache_capacity,
        ));
        let tracker = Arc::new(WatchProgressTracker::new(
            visits.clone(),
            terminals.clone(),
            pattern,
            store.clone(),
            config.watch.reconcile_interval,
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            terminals.clone(),
            config.retention.clone(),
        ));

        Ok(Self {
            gateway: TranscodeGateway::new(config.transcode.clone()),
            config,
            store,
            registry,
            broadcaster: SegmentStateBroadcaster::new(),
            visits,
            terminals,
            tracker,
            sweeper,
            catalogs: CatalogRegistry::new(),
        })
    }

    /// Replaces the catalog sources used by [`Self::start_from_catalog`].
    pub fn with_catalogs(mut self, catalogs: CatalogRegistry) -> Self {
        self.catalogs = catalogs;
        self
    }

    pub fn config(&self) -> &ReelflowConfig {
        &self.config
    }

    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> &SegmentStateBroadcaster {
        &self.broadcaster
    }

    pub fn tracker(&self) -> &Arc<WatchProgressTracker> {
        &self.tracker
    }

    pub fn sweeper(&self) -> &Arc<RetentionSweeper> {
        &self.sweeper
    }

    pub fn terminal_segments(&self) -> &Arc<TerminalSegmentCache> {
        &self.terminals
    }

    /// Reuses or starts the acquisition for `(content_id, quality)`.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::Registry` - Invalid source link or unreadable store
    pub async fn get_or_start_download(
        &self,
        content_id: i64,
        source_link: &str,
        quality: &str,
    ) -> Result<Download> {
        let download = self
            .registry
            .get_or_start(content_id, quality, source_link)
            .await?;
        Ok(download.snapshot())
    }

    /// Current state of a download.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::NotFound` - Nothing in flight or on disk for the key
    /// - `ReelflowError::Registry` - Unreadable store
    pub async fn download_status(&self, content_id: i64, quality: &str) -> Result<Download> {
        let key = DownloadKey::new(content_id, quality);
        self.registry
            .status(&key)
            .await?
            .ok_or_else(|| ReelflowError::NotFound {
                key: key.to_string(),
            })
    }

    /// Streams the media for `(content_id, quality)`, honoring `Range` headers.
    ///
    /// A download that is not yet streaming-ready yields
    /// `MediaResponse::Processing` rather than an error. Media whose row
    /// survives but whose file vanished is acquired again from its stored
    /// source link.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::NotFound` - No download and no acquired media for the key
    /// - `ReelflowError::DownloadFailed` - The acquisition ended in error
    /// - `ReelflowError::Streaming` - The response could not be started
    pub async fn serve_media(
        &self,
        content_id: i64,
        quality: &str,
        headers: &HeaderMap,
    ) -> Result<MediaResponse> {
        let key = DownloadKey::new(content_id, quality);

        if let Some(download) = self.registry.find(&key).await {
            return self.serve_download(&download, headers).await;
        }

        let Some(media) = self.store.acquired_media(&key).await? else {
            return Err(ReelflowError::NotFound {
                key: key.to_string(),
            });
        };

        let download = self
            .registry
            .get_or_start(content_id, quality, &media.source_link)
            .await?;
        self.serve_download(&download, headers).await
    }

    async fn serve_download(
        &self,
        download: &SharedDownload,
        headers: &HeaderMap,
    ) -> Result<MediaResponse> {
        let snapshot = download.snapshot();

        match snapshot.status {
            DownloadStatus::Error => Err(ReelflowError::DownloadFailed {
                key: download.key().to_string(),
                reason: snapshot.error.unwrap_or_default(),
            }),
            DownloadStatus::Completed => {
                let path = snapshot.file_path.ok_or_else(|| ReelflowError::NotFound {
                    key: download.key().to_string(),
                })?;
                let response = self.gateway.serve_file(&path, headers).await?;

                if let Err(e) = self
                    .store
                    .touch_acquired_media(download.key(), Utc::now())
                    .await
                {
                    warn!(key = %download.key(), "Failed to refresh last access time: {e}");
                }
                Ok(MediaResponse::Stream(response))
            }
            _ if snapshot.streaming_ready => {
                let asset = download.primary_asset().ok_or_else(|| {
                    ReelflowError::Streaming(StreamingError::NotFound {
                        path: snapshot.file_path.clone().unwrap_or_default(),
                    })
                })?;
                let response = self
                    .gateway
                    .serve_partial(asset.reader.clone(), &asset.file_name, headers)
                    .await?;
                Ok(MediaResponse::Stream(response))
            }
            _ => {
                debug!(key = %download.key(), progress = snapshot.progress, "Media not ready yet");
                Ok(MediaResponse::Processing(snapshot))
            }
        }
    }

    /// Notes the segment a player fetched. Anonymous requests are ignored.
    pub fn record_segment_visit(&self, user_id: Option<i64>, content_id: i64, segment: &str) {
        match user_id {
            Some(user_id) => self.visits.record(user_id, content_id, segment),
            None => debug!(content_id, "Skipping segment visit without user"),
        }
    }

    /// Live stream of segment states for `content_id`, starting with the last one.
    pub fn subscribe_to_state(&self, content_id: i64) -> StateSubscription {
        self.broadcaster.subscribe(content_id)
    }

    /// Pushes `state` to the subscribers of its content id.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::Serialization` - The state could not be serialized
    pub fn publish_state(&self, state: &SegmentState) -> Result<usize> {
        Ok(self.broadcaster.publish(state)?)
    }

    /// Looks up the best torrent for `external_id` and starts acquiring it.
    ///
    /// # Errors
    ///
    /// - `ReelflowError::Catalog` - Unknown source, provider failure or no candidate
    /// - `ReelflowError::Registry` - Invalid source link or unreadable store
    pub async fn start_from_catalog(
        &self,
        source_name: &str,
        external_id: &str,
        content_id: i64,
        quality: &str,
    ) -> Result<Download> {
        let candidate = self
            .catalogs
            .find_candidate(source_name, external_id, quality)
            .await?;

        info!(
            content_id,
            quality,
            candidate = %candidate.name,
            seeders = candidate.seeders,
            "Catalog candidate selected"
        );
        self.get_or_start_download(content_id, &candidate.source_link, quality)
            .await
    }

    /// Starts the watch tracker and both retention sweeps.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let mut tasks = BackgroundTasks::new(cancel.clone(), self.registry.clone());

        tasks.push(
            "watch-progress",
            tokio::spawn(self.tracker.clone().run(cancel.child_token())),
        );
        tasks.push(
            "media-retention",
            tokio::spawn(self.sweeper.clone().run_media_sweeps(cancel.child_token())),
        );
        tasks.push(
            "stream-retention",
            tokio::spawn(self.sweeper.clone().run_stream_sweeps(cancel.child_token())),
        );

        info!(tasks = ?tasks.task_names(), "Background tasks started");
        tasks
    }
}
