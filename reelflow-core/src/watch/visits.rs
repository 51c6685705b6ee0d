//! Last segment seen per (user, content) pair.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// One player request for a stream segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentVisit {
    pub user_id: i64,
    pub content_id: i64,
    /// Segment file name, without any directory or URL prefix
    pub segment: String,
    pub seen_at: DateTime<Utc>,
}

/// In-memory visits awaiting reconciliation.
///
/// Every request overwrites the previous visit for its pair. The tracker
/// drains visits with [`SegmentVisits::consume`], which only removes a visit
/// if no newer one replaced it while the tick was running.
#[derive(Debug, Default)]
pub struct SegmentVisits {
    visits: Mutex<HashMap<(i64, i64), SegmentVisit>>,
}

impl SegmentVisits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: i64, content_id: i64, segment: &str) {
        let segment = segment_file_name(segment);
        if segment.is_empty() {
            return;
        }

        self.visits.lock().insert(
            (user_id, content_id),
            SegmentVisit {
                user_id,
                content_id,
                segment: segment.to_string(),
                seen_at: Utc::now(),
            },
        );
    }

    /// Copies the pending visits.
    pub fn snapshot(&self) -> Vec<SegmentVisit> {
        self.visits.lock().values().cloned().collect()
    }

    /// Removes `visit` if it is still the latest for its pair.
    pub fn consume(&self, visit: &SegmentVisit) -> bool {
        let mut visits = self.visits.lock();
        let key = (visit.user_id, visit.content_id);

        if visits.get(&key) == Some(visit) {
            visits.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.visits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.lock().is_empty()
    }
}

/// Strips query strings and path prefixes from a segment reference.
fn segment_file_name(segment: &str) -> &str {
    let without_query = segment.split(['?', '#']).next().unwrap_or(segment);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
        .trim()
}
