//! Reclaims disk space for content nobody has watched recently.
//!
//! Two independent sweeps run on their own intervals: acquired source files
//! (with their `AcquiredMedia` rows) and per-content derived stream
//! directories. Each content id is one unit of work; a failure is counted
//! and logged and the sweep moves on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetentionConfig;
use crate::store::{AcquiredMedia, MediaStore};
use crate::watch::TerminalSegmentCache;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Content ids whose artifacts were deleted
    pub removed: usize,
    /// Content ids still inside the retention window
    pub skipped: usize,
    /// Content ids that could not be cleaned up this time
    pub failures: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.removed += other.removed;
        self.skipped += other.skipped;
        self.failures += other.failures;
    }
}

/// Deletes acquired media and derived streams past the retention window.
pub struct RetentionSweeper {
    store: Arc<dyn MediaStore>,
    terminals: Arc<TerminalSegmentCache>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn MediaStore>,
        terminals: Arc<TerminalSegmentCache>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            terminals,
            config,
        }
    }

    /// Oldest activity time that is still retained at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.retention_window)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        now.checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Deletes acquired files whose content was last watched before the cutoff.
    ///
    /// Media with no watch history is judged by its last access time. A row
    /// is deleted only after its file is gone, so a failed delete is retried
    /// by the next sweep.
    pub async fn sweep_acquired_media(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = self.cutoff(now);
        let mut report = SweepReport::default();

        let (latest, media) = match (
            self.store.latest_watch_by_content().await,
            self.store.list_acquired_media().await,
        ) {
            (Ok(latest), Ok(media)) => (latest, media),
            (Err(e), _) | (_, Err(e)) => {
                error!("Acquired media sweep could not read the store: {e}");
                report.failures += 1;
                return report;
            }
        };

        for row in media {
            let last_activity = latest
                .get(&row.content_id)
                .copied()
                .unwrap_or(row.last_accessed_at);

            if last_activity >= cutoff {
                report.skipped += 1;
                continue;
            }

            report.merge(self.remove_acquired(&row).await);
        }

        info!(
            removed = report.removed,
            skipped = report.skipped,
            failures = report.failures,
            %cutoff,
            "Acquired media sweep finished"
        );
        report
    }

    async fn remove_acquired(&self, row: &AcquiredMedia) -> SweepReport {
        let mut report = SweepReport::default();

        match tokio::fs::remove_file(&row.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %row.file_path.display(), "Acquired file already gone");
            }
            Err(e) => {
                warn!(
                    content_id = row.content_id,
                    path = %row.file_path.display(),
                    "Failed to delete acquired file: {e}"
                );
                report.failures += 1;
                return report;
            }
        }

        match self.store.delete_acquired_media(&row.key()).await {
            Ok(_) => {
                info!(
                    content_id = row.content_id,
                    quality = %row.quality,
                    "Removed unwatched acquired media"
                );
                report.removed += 1;
            }
            Err(e) => {
                warn!(content_id = row.content_id, "Failed to delete acquired media row: {e}");
                report.failures += 1;
            }
        }
        report
    }

    /// Deletes derived stream directories of content last watched before the cutoff.
    ///
    /// Directories without any watch history are judged by their
    /// modification time. Entries whose name is not a content id are left
    /// alone.
    pub async fn sweep_derived_streams(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = self.cutoff(now);
        let mut report = SweepReport::default();

        let latest = match self.store.latest_watch_by_content().await {
            Ok(latest) => latest,
            Err(e) => {
                error!("Derived stream sweep could not read the store: {e}");
                report.failures += 1;
                return report;
            }
        };

        let streams_dir = self.terminals.streams_dir();
        let mut entries = match tokio::fs::read_dir(streams_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                error!(path = %streams_dir.display(), "Failed to list derived streams: {e}");
                report.failures += 1;
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %streams_dir.display(), "Failed to read stream entry: {e}");
                    report.failures += 1;
                    break;
                }
            };

            let Some(content_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };

            let path = entry.path();
            let last_activity = match last_activity(&latest, content_id, &path).await {
                Some(at) => at,
                None => {
                    report.failures += 1;
                    continue;
                }
            };

            if last_activity >= cutoff {
                report.skipped += 1;
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    self.terminals.evict(content_id);
                    info!(content_id, "Removed unwatched derived stream");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(content_id, path = %path.display(), "Failed to delete derived stream: {e}");
                    report.failures += 1;
                }
            }
        }

        debug!(
            removed = report.removed,
            skipped = report.skipped,
            failures = report.failures,
            "Derived stream sweep finished"
        );
        report
    }

    /// Runs the acquired-media sweep on its interval until `cancel` fires.
    pub async fn run_media_sweeps(self: Arc<Self>, cancel: CancellationToken) {
        let sweeper = self.clone();
        periodic(
            "acquired media",
            self.config.media_sweep_interval,
            cancel,
            move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_acquired_media(Utc::now()).await;
                }
            },
        )
        .await;
    }

    /// Runs the derived-stream sweep on its interval until `cancel` fires.
    pub async fn run_stream_sweeps(self: Arc<Self>, cancel: CancellationToken) {
        let sweeper = self.clone();
        periodic(
            "derived stream",
            self.config.stream_sweep_interval,
            cancel,
            move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_derived_streams(Utc::now()).await;
                }
            },
        )
        .await;
    }
}

async fn last_activity(
    latest: &HashMap<i64, DateTime<Utc>>,
    content_id: i64,
    path: &Path,
) -> Option<DateTime<Utc>> {
    if let Some(at) = latest.get(&content_id) {
        return Some(*at);
    }

    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => Some(DateTime::<Utc>::from(modified)),
        Err(e) => {
            warn!(content_id, path = %path.display(), "Failed to read stream directory age: {e}");
            None
        }
    }
}

async fn periodic<F, Fut>(name: &str, period: Duration, cancel: CancellationToken, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(sweep = name, interval_secs = period.as_secs(), "Retention sweep started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(sweep = name, "Retention sweep stopping");
                break;
            }
            _ = ticker.tick() => sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::acquisition::DownloadKey;
    use crate::store::{InMemoryStore, WatchUpdate};

    const DAY: i64 = 24 * 3600;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<InMemoryStore>,
        terminals: Arc<TerminalSegmentCache>,
        sweeper: RetentionSweeper,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let terminals = Arc::new(TerminalSegmentCache::new(
            dir.path().join("streams"),
            "index.m3u8",
            8,
        ));
        let sweeper = RetentionSweeper::new(
            store.clone(),
            terminals.clone(),
            RetentionConfig {
                retention_window: Duration::from_secs(30 * DAY as u64),
                ..RetentionConfig::default()
            },
        );

        Fixture {
            dir,
            store,
            terminals,
            sweeper,
        }
    }

    async fn acquired(fx: &Fixture, content_id: i64, accessed: DateTime<Utc>) -> PathBuf {
        let path = fx.dir.path().join(format!("{content_id}.mkv"));
        std::fs::write(&path, b"movie").unwrap();
        fx.store
            .upsert_acquired_media(AcquiredMedia {
                content_id,
                quality: "720p".to_string(),
                file_path: path.clone(),
                source_link: String::new(),
                acquired_at: accessed,
                last_accessed_at: accessed,
                file_size_bytes: 5,
            })
            .await
            .unwrap();
        path
    }

    async fn watched(fx: &Fixture, user_id: i64, content_id: i64, at: DateTime<Utc>) {
        fx.store
            .apply_watch_update(WatchUpdate {
                user_id,
                content_id,
                segment: "seg_0001.ts".to_string(),
                progress_percent: 1.0,
                reached_terminal: false,
                at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_media_is_removed() {
        let fx = fixture();
        let now = Utc::now();
        let path = acquired(&fx, 1, now - chrono::Duration::seconds(60 * DAY)).await;
        watched(&fx, 10, 1, now - chrono::Duration::seconds(45 * DAY)).await;

        let report = fx.sweeper.sweep_acquired_media(now).await;

        assert_eq!(report.removed, 1);
        assert!(!path.exists());
        let key = DownloadKey::new(1, "720p");
        assert!(fx.store.acquired_media(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_recent_viewer_keeps_media() {
        let fx = fixture();
        let now = Utc::now();
        let path = acquired(&fx, 2, now - chrono::Duration::seconds(90 * DAY)).await;
        watched(&fx, 10, 2, now - chrono::Duration::seconds(60 * DAY)).await;
        watched(&fx, 11, 2, now - chrono::Duration::seconds(2 * DAY)).await;

        let report = fx.sweeper.sweep_acquired_media(now).await;

        assert_eq!(report, SweepReport { removed: 0, skipped: 1, failures: 0 });
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_watch_exactly_at_cutoff_is_kept() {
        let fx = fixture();
        let now = Utc::now();
        acquired(&fx, 3, now - chrono::Duration::seconds(90 * DAY)).await;
        watched(&fx, 10, 3, fx.sweeper.cutoff(now)).await;

        let report = fx.sweeper.sweep_acquired_media(now).await;
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_unwatched_media_uses_last_access() {
        let fx = fixture();
        let now = Utc::now();
        let fresh = acquired(&fx, 4, now - chrono::Duration::seconds(DAY)).await;
        let stale = acquired(&fx, 5, now - chrono::Duration::seconds(31 * DAY)).await;

        let report = fx.sweeper.sweep_acquired_media(now).await;

        assert_eq!(report.removed, 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_row_failure_does_not_stop_sweep() {
        let fx = fixture();
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(60 * DAY);
        let first = acquired(&fx, 6, old).await;
        let second = acquired(&fx, 7, old).await;
        fx.store.set_reject_writes(true);

        let report = fx.sweeper.sweep_acquired_media(now).await;

        assert_eq!(report.failures, 2);
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_stale_stream_directory_is_removed_and_evicted() {
        let fx = fixture();
        let now = Utc::now();
        let streams = fx.terminals.streams_dir().to_path_buf();
        for id in [20, 21] {
            let dir = streams.join(id.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("index.m3u8"),
                "#EXTM3U\nseg_0001.ts\n#EXT-X-ENDLIST\n",
            )
            .unwrap();
        }
        std::fs::create_dir_all(streams.join("scratch")).unwrap();
        watched(&fx, 1, 20, now - chrono::Duration::seconds(40 * DAY)).await;
        watched(&fx, 1, 21, now - chrono::Duration::seconds(DAY)).await;
        assert!(fx.terminals.terminal_segment(20).await.is_some());

        let report = fx.sweeper.sweep_derived_streams(now).await;

        assert_eq!(report, SweepReport { removed: 1, skipped: 1, failures: 0 });
        assert!(!streams.join("20").exists());
        assert!(streams.join("21").exists());
        assert!(streams.join("scratch").exists());
        assert!(fx.terminals.terminal_segment(20).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_streams_dir_is_empty_sweep() {
        let fx = fixture();

        let report = fx.sweeper.sweep_derived_streams(Utc::now()).await;
        assert_eq!(report, SweepReport::default());
    }
}
