//! Watch percentage from segment file names.

use regex::Regex;

/// Extracts the numeric index from segment file names.
///
/// The first capture group of the pattern must match the index digits.
#[derive(Debug, Clone)]
pub struct SegmentIndexPattern {
    regex: Regex,
}

impl SegmentIndexPattern {
    /// # Errors
    ///
    /// - `regex::Error` - Pattern does not compile
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn index_of(&self, segment: &str) -> Option<u64> {
        self.regex
            .captures(segment)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }
}

/// Percentage of the content watched when `segment` is the latest visit.
///
/// 100 for the terminal segment, otherwise the ratio of segment indices
/// clamped to 100. Zero when no terminal is known or an index cannot be
/// parsed.
pub fn segment_progress(segment: &str, terminal: Option<&str>, pattern: &SegmentIndexPattern) -> f64 {
    let Some(terminal) = terminal else {
        return 0.0;
    };
    if segment == terminal {
        return 100.0;
    }

    match (pattern.index_of(segment), pattern.index_of(terminal)) {
        (Some(index), Some(last)) if last > 0 => {
            (index as f64 / last as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}
