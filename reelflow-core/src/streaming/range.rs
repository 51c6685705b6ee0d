//! HTTP `Range` header handling for pass-through responses.

use axum::http::{HeaderMap, header};

/// Inclusive byte range resolved against a known file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a file of `file_size` bytes.
    pub fn content_range(&self, file_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, file_size)
    }
}

/// Outcome of interpreting a request's `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range, serve the whole file
    Full,
    /// Serve this slice with 206 Partial Content
    Partial(ByteRange),
    /// Range lies outside the file, answer 416
    Unsatisfiable,
}

/// Resolves the `Range` header of a request against `file_size`.
///
/// Supports `bytes=a-b`, `bytes=a-` and `bytes=-n`. Multi-range and
/// malformed headers are ignored and the whole file is served. An end past
/// the file is clamped to the last byte.
pub fn resolve_range(headers: &HeaderMap, file_size: u64) -> RangeRequest {
    let Some(value) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return RangeRequest::Full;
    };
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };

    let (start, end) = (start.trim(), end.trim());
    match (start.is_empty(), end.is_empty()) {
        // bytes=-n: final n bytes
        (true, false) => {
            let Ok(suffix) = end.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if suffix == 0 || file_size == 0 {
                return RangeRequest::Unsatisfiable;
            }
            RangeRequest::Partial(ByteRange {
                start: file_size.saturating_sub(suffix),
                end: file_size - 1,
            })
        }
        (false, _) => {
            let Ok(start) = start.parse::<u64>() else {
                return RangeRequest::Full;
            };
            let end = if end.is_empty() {
                None
            } else {
                match end.parse::<u64>() {
                    Ok(end) => Some(end),
                    Err(_) => return RangeRequest::Full,
                }
            };

            if start >= file_size || end.is_some_and(|end| end < start) {
                return RangeRequest::Unsatisfiable;
            }

            RangeRequest::Partial(ByteRange {
                start,
                end: end.unwrap_or(file_size - 1).min(file_size - 1),
            })
        }
        (true, true) => RangeRequest::Full,
    }
}
