//! Watch-progress tracking.
//!
//! Players report the segment they fetch; a periodic tracker folds those
//! reports into per-user watch history without touching the request path.

pub mod playlist;
pub mod progress;
pub mod tracker;
pub mod visits;

pub use playlist::{TerminalSegmentCache, parse_terminal_segment};
pub use progress::{SegmentIndexPattern, segment_progress};
pub use tracker::{ReconcileReport, WatchProgressTracker};
pub use visits::{SegmentVisit, SegmentVisits};
