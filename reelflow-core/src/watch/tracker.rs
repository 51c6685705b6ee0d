//! Periodic reconciliation of segment visits into watch history.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::playlist::TerminalSegmentCache;
use super::progress::{SegmentIndexPattern, segment_progress};
use super::visits::{SegmentVisit, SegmentVisits};
use crate::store::{MediaStore, WatchUpdate};

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Visits merged into watch history
    pub applied: usize,
    /// Visits whose store write failed; retried on the next tick
    pub failed: usize,
}

/// Turns [`SegmentVisits`] into persisted [`crate::store::WatchHistoryEntry`] rows.
pub struct WatchProgressTracker {
    visits: Arc<SegmentVisits>,
    terminals: Arc<TerminalSegmentCache>,
    pattern: SegmentIndexPattern,
    store: Arc<dyn MediaStore>,
    interval: Duration,
}

impl WatchProgressTracker {
    pub fn new(
        visits: Arc<SegmentVisits>,
        terminals: Arc<TerminalSegmentCache>,
        pattern: SegmentIndexPattern,
        store: Arc<dyn MediaStore>,
        interval: Duration,
    ) -> Self {
        Self {
            visits,
            terminals,
            pattern,
            store,
            interval,
        }
    }

    /// Reconciles every pending visit once.
    ///
    /// Each (user, content) pair is independent: a failed write is logged,
    /// the visit stays pending and the remaining pairs are still processed.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for visit in self.visits.snapshot() {
            match self.reconcile_visit(&visit).await {
                Ok(()) => {
                    self.visits.consume(&visit);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(
                        user_id = visit.user_id,
                        content_id = visit.content_id,
                        "Failed to record watch progress: {e}"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.applied > 0 || report.failed > 0 {
            debug!(applied = report.applied, failed = report.failed, "Watch progress reconciled");
        }
        report
    }

    async fn reconcile_visit(&self, visit: &SegmentVisit) -> Result<(), crate::store::StoreError> {
        let terminal = self.terminals.terminal_segment(visit.content_id).await;
        let progress_percent = segment_progress(&visit.segment, terminal.as_deref(), &self.pattern);

        let entry = self
            .store
            .apply_watch_update(WatchUpdate {
                user_id: visit.user_id,
                content_id: visit.content_id,
                segment: visit.segment.clone(),
                progress_percent,
                reached_terminal: terminal.as_deref() == Some(visit.segment.as_str()),
                at: visit.seen_at,
            })
            .await?;

        debug!(
            user_id = entry.user_id,
            content_id = entry.content_id,
            segment = %entry.last_segment,
            progress = entry.watch_progress_percent,
            watch_count = entry.watch_count,
            "Watch history updated"
        );
        Ok(())
    }

    /// Reconciles on a fixed interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Watch progress tracker started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watch progress tracker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::InMemoryStore;

    const PLAYLIST: &str = "#EXTM3U\n#EXTINF:6.0,\nseg_0099.ts\n#EXTINF:6.0,\nseg_0100.ts\n#EXT-X-ENDLIST\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        visits: Arc<SegmentVisits>,
        store: Arc<InMemoryStore>,
        tracker: WatchProgressTracker,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let stream_dir = dir.path().join("7");
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(stream_dir.join("index.m3u8"), PLAYLIST).unwrap();

        let visits = Arc::new(SegmentVisits::new());
        let store = Arc::new(InMemoryStore::new());
        let tracker = WatchProgressTracker::new(
            visits.clone(),
            Arc::new(TerminalSegmentCache::new(dir.path(), "index.m3u8", 8)),
            SegmentIndexPattern::new(r"(\d+)\.ts$").unwrap(),
            store.clone(),
            Duration::from_millis(10),
        );

        Fixture {
            _dir: dir,
            visits,
            store,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_visit_becomes_watch_history() {
        let fx = fixture();
        fx.visits.record(1, 7, "seg_0042.ts");

        let report = fx.tracker.reconcile_once().await;

        assert_eq!(report, ReconcileReport { applied: 1, failed: 0 });
        let entry = fx.store.watch_history(1, 7).await.unwrap().unwrap();
        assert!((entry.watch_progress_percent - 42.0).abs() < 1e-9);
        assert_eq!(entry.watch_count, 0);
        assert!(fx.visits.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_segment_counts_once_across_ticks() {
        let fx = fixture();

        fx.visits.record(1, 7, "seg_0100.ts");
        fx.tracker.reconcile_once().await;
        fx.visits.record(1, 7, "seg_0100.ts");
        fx.tracker.reconcile_once().await;

        let entry = fx.store.watch_history(1, 7).await.unwrap().unwrap();
        assert_eq!(entry.watch_count, 1);
        assert_eq!(entry.watch_progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_unknown_content_records_zero_progress() {
        let fx = fixture();
        fx.visits.record(2, 99, "seg_0005.ts");

        fx.tracker.reconcile_once().await;

        let entry = fx.store.watch_history(2, 99).await.unwrap().unwrap();
        assert_eq!(entry.watch_progress_percent, 0.0);
    }

    #[tokio::test]
    async fn test_failed_writes_stay_pending() {
        let fx = fixture();
        fx.visits.record(1, 7, "seg_0010.ts");
        fx.visits.record(2, 7, "seg_0020.ts");
        fx.store.set_reject_writes(true);

        let report = fx.tracker.reconcile_once().await;
        assert_eq!(report, ReconcileReport { applied: 0, failed: 2 });
        assert_eq!(fx.visits.len(), 2);

        fx.store.set_reject_writes(false);
        let report = fx.tracker.reconcile_once().await;
        assert_eq!(report.applied, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fx = fixture();
        fx.visits.record(1, 7, "seg_0050.ts");
        let store = fx.store.clone();
        let tracker = Arc::new(fx.tracker);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(tracker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(store.watch_history(1, 7).await.unwrap().is_some());
    }
}
