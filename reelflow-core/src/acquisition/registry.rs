//! Process-wide registry of in-flight downloads.
//!
//! At most one acquisition exists per [`DownloadKey`]. The registry lock is
//! held across the durable-store lookup, so a request racing a completing
//! acquisition either finds the live record or the persisted row, never
//! neither.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::download::{Download, DownloadKey, SharedDownload};
use super::engine::AcquisitionEngine;
use super::AcquisitionError;
use crate::store::{MediaStore, StoreError};
use crate::torrent::{SourceLink, TorrentError};

/// Errors returned to callers of the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid source link: {0}")]
    InvalidSourceLink(#[from] TorrentError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

struct RegistryInner {
    entries: Mutex<HashMap<DownloadKey, SharedDownload>>,
    engine: AcquisitionEngine,
    store: Arc<dyn MediaStore>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Deduplicates acquisitions and owns their background tasks.
#[derive(Clone)]
pub struct DownloadRegistry {
    inner: Arc<RegistryInner>,
}

impl DownloadRegistry {
    pub fn new(engine: AcquisitionEngine, store: Arc<dyn MediaStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                engine,
                store,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Returns the download for `(content_id, quality)`, starting one if needed.
    ///
    /// Resolution order: a live registry entry, then media already on disk
    /// (returned as a completed record), then a fresh acquisition of
    /// `source_link`. A row whose file has disappeared is deleted and the
    /// media acquired again. Never waits for the download itself.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidSourceLink` - A new acquisition was needed and the link is malformed
    /// - `RegistryError::Store` - The durable store could not be read
    pub async fn get_or_start(
        &self,
        content_id: i64,
        quality: &str,
        source_link: &str,
    ) -> Result<SharedDownload, RegistryError> {
        let key = DownloadKey::new(content_id, quality);
        let mut entries = self.inner.entries.lock().await;

        if let Some(existing) = entries.get(&key) {
            debug!(%key, status = ?existing.status(), "Joining existing download");
            return Ok(existing.clone());
        }

        if let Some(completed) = self.acquired_on_disk(&key).await? {
            return Ok(completed);
        }

        let source = SourceLink::parse(source_link)?;
        let download = SharedDownload::new(key.clone(), source.as_str());
        entries.insert(key.clone(), download.clone());
        drop(entries);

        info!(%key, info_hash = %source.info_hash(), "Starting acquisition");
        self.spawn_acquisition(download.clone(), source);

        Ok(download)
    }

    /// Snapshot of the download for `key`, live or already acquired.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Store` - The durable store could not be read
    pub async fn status(&self, key: &DownloadKey) -> Result<Option<Download>, RegistryError> {
        if let Some(live) = self.find(key).await {
            return Ok(Some(live.snapshot()));
        }

        let Some(media) = self.inner.store.acquired_media(key).await? else {
            return Ok(None);
        };

        if file_exists(&media.file_path).await {
            Ok(Some(SharedDownload::from_acquired(&media).snapshot()))
        } else {
            Ok(None)
        }
    }

    /// Live registry entry for `key`, if any.
    pub async fn find(&self, key: &DownloadKey) -> Option<SharedDownload> {
        self.inner.entries.lock().await.get(key).cloned()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Cancels every acquisition and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down download registry");
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Looks up a persisted row and checks its file is still present.
    async fn acquired_on_disk(
        &self,
        key: &DownloadKey,
    ) -> Result<Option<SharedDownload>, RegistryError> {
        let Some(media) = self.inner.store.acquired_media(key).await? else {
            return Ok(None);
        };

        if file_exists(&media.file_path).await {
            if let Err(e) = self.inner.store.touch_acquired_media(key, Utc::now()).await {
                warn!(%key, "Failed to refresh last access time: {e}");
            }
            debug!(%key, path = %media.file_path.display(), "Serving previously acquired media");
            return Ok(Some(SharedDownload::from_acquired(&media)));
        }

        warn!(
            %key,
            path = %media.file_path.display(),
            "Acquired media missing from disk, acquiring again"
        );
        if let Err(e) = self.inner.store.delete_acquired_media(key).await {
            warn!(%key, "Failed to delete dangling acquired media row: {e}");
        }
        Ok(None)
    }

    fn spawn_acquisition(&self, download: SharedDownload, source: SourceLink) {
        let registry = self.clone();
        let cancel = self.inner.cancel.child_token();

        self.inner.tasks.spawn(async move {
            let result = registry.inner.engine.run(&download, &source, cancel).await;

            match result {
                Ok(completion) if completion.persisted => {
                    registry.remove_entry(&download).await;
                }
                Ok(_) => {
                    // Without a durable row the entry stays as the only
                    // record that the media is on disk.
                    warn!(key = %download.key(), "Keeping completed download in registry");
                }
                Err(AcquisitionError::Cancelled) => {
                    download.mark_failed(AcquisitionError::Cancelled.to_string());
                    registry.remove_entry(&download).await;
                }
                Err(e) => {
                    warn!(key = %download.key(), "Acquisition failed: {e}");
                    download.mark_failed(e.to_string());
                    registry.remove_entry(&download).await;
                }
            }
        });
    }

    /// Removes `download` from the map unless a newer record replaced it.
    async fn remove_entry(&self, download: &SharedDownload) {
        let mut entries = self.inner.entries.lock().await;
        if entries
            .get(download.key())
            .is_some_and(|current| current.same_record(download))
        {
            entries.remove(download.key());
        }
    }
}

async fn file_exists(path: &std::path::Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::acquisition::DownloadStatus;
    use crate::config::ReelflowConfig;
    use crate::store::{AcquiredMedia, InMemoryStore};
    use crate::torrent::{SimulatedTorrent, SimulatedTorrentClient};

    const LINK: &str = "magnet:?xt=urn:btih:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb&dn=Movie";

    type Fixture = (
        DownloadRegistry,
        Arc<SimulatedTorrentClient>,
        Arc<InMemoryStore>,
    );

    fn registry(dir: &std::path::Path) -> Fixture {
        let client = Arc::new(SimulatedTorrentClient::new(dir));
        let store = Arc::new(InMemoryStore::new());
        let engine = AcquisitionEngine::new(
            ReelflowConfig::for_testing().acquisition,
            client.clone(),
            store.clone(),
        );
        (DownloadRegistry::new(engine, store.clone()), client, store)
    }

    async fn wait_for_removal(registry: &DownloadRegistry, key: &DownloadKey) {
        for _ in 0..200 {
            if registry.find(key).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("download {key} never left the registry");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_acquisition() {
        let dir = tempdir().unwrap();
        let (registry, client, _) = registry(dir.path());
        let torrent = SimulatedTorrent::new([("movie.mkv", 10 * 1024 * 1024)]);
        client.register(&SourceLink::parse(LINK).unwrap(), torrent.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_start(42, "720p", LINK).await.unwrap()
            }));
        }

        let mut downloads = Vec::new();
        for handle in handles {
            downloads.push(handle.await.unwrap());
        }

        assert!(downloads.iter().all(|d| d.same_record(&downloads[0])));
        assert_eq!(registry.in_flight_count().await, 1);

        registry.shutdown().await;
        assert_eq!(torrent.add_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_link_is_rejected_without_registering() {
        let dir = tempdir().unwrap();
        let (registry, _, _) = registry(dir.path());

        let result = registry.get_or_start(1, "720p", "not a magnet").await;

        assert!(matches!(result, Err(RegistryError::InvalidSourceLink(_))));
        assert_eq!(registry.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_acquisition_leaves_registry() {
        let dir = tempdir().unwrap();
        let (registry, client, _) = registry(dir.path());
        let torrent = SimulatedTorrent::new([("notes.txt", 100)]);
        client.register(&SourceLink::parse(LINK).unwrap(), torrent.clone());
        torrent.release_metadata();

        let download = registry.get_or_start(5, "1080p", LINK).await.unwrap();
        wait_for_removal(&registry, download.key()).await;

        let snapshot = download.snapshot();
        assert_eq!(snapshot.status, DownloadStatus::Error);
        assert!(snapshot.error.unwrap().starts_with("no video file found"));

        let retry = registry.get_or_start(5, "1080p", LINK).await.unwrap();
        assert!(!retry.same_record(&download));
        registry.shutdown().await;
        assert_eq!(torrent.add_count(), 2);
    }

    #[tokio::test]
    async fn test_acquired_media_is_served_without_new_acquisition() {
        let dir = tempdir().unwrap();
        let (registry, client, store) = registry(dir.path());
        let torrent = SimulatedTorrent::new([("movie.mp4", 1024)]);
        client.register(&SourceLink::parse(LINK).unwrap(), torrent.clone());

        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let acquired_at = Utc::now() - chrono::Duration::days(2);
        store
            .upsert_acquired_media(AcquiredMedia {
                content_id: 9,
                quality: "720p".to_string(),
                file_path: path,
                source_link: LINK.to_string(),
                acquired_at,
                last_accessed_at: acquired_at,
                file_size_bytes: 1024,
            })
            .await
            .unwrap();

        let download = registry.get_or_start(9, "720p", LINK).await.unwrap();

        assert_eq!(download.status(), DownloadStatus::Completed);
        assert_eq!(torrent.add_count(), 0);
        let row = store
            .acquired_media(&DownloadKey::new(9, "720p"))
            .await
            .unwrap()
            .unwrap();
        assert!(row.last_accessed_at > acquired_at);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_acquisitions() {
        let dir = tempdir().unwrap();
        let (registry, client, _) = registry(dir.path());
        let torrent = SimulatedTorrent::new([("movie.mkv", 10 * 1024 * 1024)]);
        client.register(&SourceLink::parse(LINK).unwrap(), torrent.clone());
        torrent.release_metadata();
        torrent.advance(6 * 1024 * 1024);

        let download = registry.get_or_start(3, "480p", LINK).await.unwrap();
        registry.shutdown().await;

        assert_eq!(download.status(), DownloadStatus::Error);
        assert_eq!(registry.in_flight_count().await, 0);
    }
}
