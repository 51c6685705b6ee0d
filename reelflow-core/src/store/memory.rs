//! Volatile store for tests and single-run tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    AcquiredMedia, MediaStore, StoreError, StoreResult, StoreTables, WatchHistoryEntry,
    WatchUpdate,
};
use crate::acquisition::DownloadKey;

/// Store that keeps every row in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<StoreTables>,
    reject_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `StoreError::WriteRejected`.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected {
                reason: "store is read-only".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for InMemoryStore {
    async fn upsert_acquired_media(&self, media: AcquiredMedia) -> StoreResult<()> {
        self.check_writable()?;
        self.tables.lock().upsert_acquired_media(media);
        Ok(())
    }

    async fn acquired_media(&self, key: &DownloadKey) -> StoreResult<Option<AcquiredMedia>> {
        Ok(self.tables.lock().acquired_media(key))
    }

    async fn touch_acquired_media(
        &self,
        key: &DownloadKey,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.tables.lock().touch_acquired_media(key, at))
    }

    async fn delete_acquired_media(&self, key: &DownloadKey) -> StoreResult<bool> {
        self.check_writable()?;
        Ok(self.tables.lock().delete_acquired_media(key))
    }

    async fn list_acquired_media(&self) -> StoreResult<Vec<AcquiredMedia>> {
        Ok(self.tables.lock().list_acquired_media())
    }

    async fn apply_watch_update(&self, update: WatchUpdate) -> StoreResult<WatchHistoryEntry> {
        self.check_writable()?;
        Ok(self.tables.lock().apply_watch_update(&update))
    }

    async fn watch_history(
        &self,
        user_id: i64,
        content_id: i64,
    ) -> StoreResult<Option<WatchHistoryEntry>> {
        Ok(self.tables.lock().watch_history(user_id, content_id))
    }

    async fn latest_watch_by_content(&self) -> StoreResult<HashMap<i64, DateTime<Utc>>> {
        Ok(self.tables.lock().latest_watch_by_content())
    }
}
