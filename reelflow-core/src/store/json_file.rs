//! Store persisted as a single JSON document.
//!
//! Each mutation is applied to a copy of the tables, written to a sibling
//! temporary file and renamed over the document. The in-memory tables are
//! replaced only after the rename succeeds, so a failed write leaves both the
//! file and the process view unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    AcquiredMedia, MediaStore, StoreError, StoreResult, StoreSnapshot, StoreTables,
    WatchHistoryEntry, WatchUpdate,
};
use crate::acquisition::DownloadKey;

/// File-backed store used by the daemon.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<StoreTables>,
}

impl JsonFileStore {
    /// Opens the document at `path`, starting empty when it does not exist.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - Document exists but cannot be read
    /// - `StoreError::Serialization` - Document is not a valid snapshot
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let tables = match tokio::fs::read(&path).await {
            Ok(contents) => {
                let snapshot: StoreSnapshot = serde_json::from_slice(&contents)?;
                StoreTables::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Store document not found, starting empty");
                StoreTables::default()
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` to a copy of the tables and commits it once durable.
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreTables) -> T) -> StoreResult<T> {
        let mut tables = self.tables.lock().await;
        let mut staged = tables.clone();
        let output = change(&mut staged);

        self.persist(&staged).await?;
        *tables = staged;
        Ok(output)
    }

    async fn persist(&self, tables: &StoreTables) -> StoreResult<()> {
        let contents = serde_json::to_vec_pretty(&tables.to_snapshot())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, &contents)
            .await
            .map_err(|e| StoreError::io(&staging, e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        debug!(path = %self.path.display(), bytes = contents.len(), "Store persisted");
        Ok(())
    }
}

#[async_trait]
impl MediaStore for JsonFileStore {
    async fn upsert_acquired_media(&self, media: AcquiredMedia) -> StoreResult<()> {
        self.mutate(|tables| tables.upsert_acquired_media(media)).await
    }

    async fn acquired_media(&self, key: &DownloadKey) -> StoreResult<Option<AcquiredMedia>> {
        Ok(self.tables.lock().await.acquired_media(key))
    }

    async fn touch_acquired_media(
        &self,
        key: &DownloadKey,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.mutate(|tables| tables.touch_acquired_media(key, at))
            .await
    }

    async fn delete_acquired_media(&self, key: &DownloadKey) -> StoreResult<bool> {
        self.mutate(|tables| tables.delete_acquired_media(key)).await
    }

    async fn list_acquired_media(&self) -> StoreResult<Vec<AcquiredMedia>> {
        Ok(self.tables.lock().await.list_acquired_media())
    }

    async fn apply_watch_update(&self, update: WatchUpdate) -> StoreResult<WatchHistoryEntry> {
        self.mutate(|tables| tables.apply_watch_update(&update))
            .await
    }

    async fn watch_history(
        &self,
        user_id: i64,
        content_id: i64,
    ) -> StoreResult<Option<WatchHistoryEntry>> {
        Ok(self.tables.lock().await.watch_history(user_id, content_id))
    }

    async fn latest_watch_by_content(&self) -> StoreResult<HashMap<i64, DateTime<Utc>>> {
        Ok(self.tables.lock().await.latest_watch_by_content())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn media(content_id: i64) -> AcquiredMedia {
        let now = Utc::now();
        AcquiredMedia {
            content_id,
            quality: "720p".to_string(),
            file_path: PathBuf::from(format!("/downloads/{content_id}.mp4")),
            source_link: "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"
                .to_string(),
            acquired_at: now,
            last_accessed_at: now,
            file_size_bytes: 50 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store").join("reelflow.json");
        let row = media(42);

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.upsert_acquired_media(row.clone()).await.unwrap();
            store
                .apply_watch_update(WatchUpdate {
                    user_id: 9,
                    content_id: 42,
                    segment: "seg_0100.ts".to_string(),
                    progress_percent: 100.0,
                    reached_terminal: true,
                    at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let key = DownloadKey::new(42, "720p");
        assert_eq!(reopened.acquired_media(&key).await.unwrap(), Some(row));
        let history = reopened.watch_history(9, 42).await.unwrap().unwrap();
        assert_eq!(history.watch_count, 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_document_starts_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("absent.json"))
            .await
            .unwrap();

        assert!(store.list_acquired_media().await.unwrap().is_empty());
        assert!(store.latest_watch_by_content().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = JsonFileStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reelflow.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.upsert_acquired_media(media(1)).await.unwrap();

        // A directory squatting on the staging path makes the next write fail
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let result = store.upsert_acquired_media(media(2)).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert_eq!(store.list_acquired_media().await.unwrap().len(), 1);
    }
}
