//! Durable records shared by acquisition, reconciliation and retention.
//!
//! Every mutation is a single upsert or delete keyed by the record's unique
//! key and applied under the store's own lock, so concurrent periodic tasks
//! and request handlers never lose each other's updates.

pub mod json_file;
pub mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use json_file::JsonFileStore;
pub use memory::InMemoryStore;
use serde::{Deserialize, Serialize};

use crate::acquisition::DownloadKey;

/// A fully acquired file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredMedia {
    pub content_id: i64,
    pub quality: String,
    pub file_path: PathBuf,
    pub source_link: String,
    pub acquired_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub file_size_bytes: u64,
}

impl AcquiredMedia {
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(self.content_id, self.quality.clone())
    }
}

/// Per-user watch progress for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchHistoryEntry {
    pub user_id: i64,
    pub content_id: i64,
    pub last_segment: String,
    pub watch_progress_percent: f64,
    pub watch_count: u32,
    pub watched_at: DateTime<Utc>,
}

/// One reconciled segment visit to merge into watch history.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpdate {
    pub user_id: i64,
    pub content_id: i64,
    pub segment: String,
    pub progress_percent: f64,
    /// The segment is the last one of the content's playlist
    pub reached_terminal: bool,
    pub at: DateTime<Utc>,
}

impl WatchHistoryEntry {
    /// Merges `update` into the previous row, if any.
    ///
    /// The watch count grows only when the terminal segment is reached and
    /// differs from the previously stored segment, so repeated reports of the
    /// same final segment count once.
    pub fn merged(previous: Option<&WatchHistoryEntry>, update: &WatchUpdate) -> Self {
        let watch_count = match previous {
            None => u32::from(update.reached_terminal),
            Some(previous) if update.reached_terminal && previous.last_segment != update.segment => {
                previous.watch_count + 1
            }
            Some(previous) => previous.watch_count,
        };

        Self {
            user_id: update.user_id,
            content_id: update.content_id,
            last_segment: update.segment.clone(),
            watch_progress_percent: update.progress_percent,
            watch_count,
            watched_at: update.at,
        }
    }
}

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store write rejected: {reason}")]
    WriteRejected { reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional access to [`AcquiredMedia`] and [`WatchHistoryEntry`] rows.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Inserts or replaces the row for `media.key()`.
    async fn upsert_acquired_media(&self, media: AcquiredMedia) -> StoreResult<()>;

    async fn acquired_media(&self, key: &DownloadKey) -> StoreResult<Option<AcquiredMedia>>;

    /// Refreshes `last_accessed_at`. Returns false when no row exists.
    async fn touch_acquired_media(&self, key: &DownloadKey, at: DateTime<Utc>)
    -> StoreResult<bool>;

    /// Deletes the row. Returns false when no row existed.
    async fn delete_acquired_media(&self, key: &DownloadKey) -> StoreResult<bool>;

    async fn list_acquired_media(&self) -> StoreResult<Vec<AcquiredMedia>>;

    /// Atomically merges `update` into the (user, content) row.
    async fn apply_watch_update(&self, update: WatchUpdate) -> StoreResult<WatchHistoryEntry>;

    async fn watch_history(
        &self,
        user_id: i64,
        content_id: i64,
    ) -> StoreResult<Option<WatchHistoryEntry>>;

    /// Most recent `watched_at` across all users, per content id.
    async fn latest_watch_by_content(&self) -> StoreResult<HashMap<i64, DateTime<Utc>>>;
}

/// Table contents shared by the in-memory and JSON stores.
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreTables {
    acquired: HashMap<DownloadKey, AcquiredMedia>,
    history: HashMap<(i64, i64), WatchHistoryEntry>,
}

/// Serialized form of [`StoreTables`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    acquired_media: Vec<AcquiredMedia>,
    watch_history: Vec<WatchHistoryEntry>,
}

impl StoreTables {
    fn upsert_acquired_media(&mut self, media: AcquiredMedia) {
        self.acquired.insert(media.key(), media);
    }

    fn acquired_media(&self, key: &DownloadKey) -> Option<AcquiredMedia> {
        self.acquired.get(key).cloned()
    }

    fn touch_acquired_media(&mut self, key: &DownloadKey, at: DateTime<Utc>) -> bool {
        match self.acquired.get_mut(key) {
            Some(media) => {
                media.last_accessed_at = media.last_accessed_at.max(at);
                true
            }
            None => false,
        }
    }

    fn delete_acquired_media(&mut self, key: &DownloadKey) -> bool {
        self.acquired.remove(key).is_some()
    }

    fn list_acquired_media(&self) -> Vec<AcquiredMedia> {
        let mut media: Vec<_> = self.acquired.values().cloned().collect();
        media.sort_by(|a, b| {
            (a.content_id, a.quality.as_str()).cmp(&(b.content_id, b.quality.as_str()))
        });
        media
    }

    fn apply_watch_update(&mut self, update: &WatchUpdate) -> WatchHistoryEntry {
        let key = (update.user_id, update.content_id);
        let entry = WatchHistoryEntry::merged(self.history.get(&key), update);
        self.history.insert(key, entry.clone());
        entry
    }

    fn watch_history(&self, user_id: i64, content_id: i64) -> Option<WatchHistoryEntry> {
        self.history.get(&(user_id, content_id)).cloned()
    }

    fn latest_watch_by_content(&self) -> HashMap<i64, DateTime<Utc>> {
        let mut latest: HashMap<i64, DateTime<Utc>> = HashMap::new();
        for entry in self.history.values() {
            latest
                .entry(entry.content_id)
                .and_modify(|at| *at = (*at).max(entry.watched_at))
                .or_insert(entry.watched_at);
        }
        latest
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut tables = Self::default();
        for media in snapshot.acquired_media {
            tables.upsert_acquired_media(media);
        }
        for entry in snapshot.watch_history {
            tables
                .history
                .insert((entry.user_id, entry.content_id), entry);
        }
        tables
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        let mut watch_history: Vec<_> = self.history.values().cloned().collect();
        watch_history.sort_by_key(|entry| (entry.user_id, entry.content_id));

        StoreSnapshot {
            acquired_media: self.list_acquired_media(),
            watch_history,
        }
    }
}
