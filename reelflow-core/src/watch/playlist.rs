//! Terminal segment lookup from per-content HLS playlists.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

const END_LIST_TAG: &str = "#EXT-X-ENDLIST";

/// Last segment listed in a finished playlist.
///
/// Returns `None` while the playlist is still growing (no end-list tag) or
/// lists no segments.
pub fn parse_terminal_segment(playlist: &str) -> Option<String> {
    let mut finished = false;
    let mut last = None;

    for line in playlist.lines().map(str::trim) {
        if line == END_LIST_TAG {
            finished = true;
        } else if !line.is_empty() && !line.starts_with('#') {
            last = Some(line);
        }
    }

    if !finished {
        return None;
    }

    last.map(|uri| uri.rsplit('/').next().unwrap_or(uri).to_string())
}

/// Caches terminal segments so reconciliation does not reparse playlists.
pub struct TerminalSegmentCache {
    streams_dir: PathBuf,
    playlist_name: String,
    cache: Mutex<LruCache<i64, String>>,
}

impl TerminalSegmentCache {
    pub fn new(streams_dir: impl Into<PathBuf>, playlist_name: impl Into<String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            streams_dir: streams_dir.into(),
            playlist_name: playlist_name.into(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn streams_dir(&self) -> &Path {
        &self.streams_dir
    }

    /// Directory holding the derived stream of `content_id`.
    pub fn stream_dir(&self, content_id: i64) -> PathBuf {
        self.streams_dir.join(content_id.to_string())
    }

    /// Terminal segment of `content_id`, if its playlist is finished.
    pub async fn terminal_segment(&self, content_id: i64) -> Option<String> {
        let cached = self.cache.lock().get(&content_id).cloned();
        if cached.is_some() {
            return cached;
        }

        let path = self.stream_dir(content_id).join(&self.playlist_name);
        let playlist = match tokio::fs::read_to_string(&path).await {
            Ok(playlist) => playlist,
            Err(e) => {
                debug!(content_id, path = %path.display(), "Playlist unavailable: {e}");
                return None;
            }
        };

        let terminal = parse_terminal_segment(&playlist)?;
        self.cache.lock().put(content_id, terminal.clone());
        Some(terminal)
    }

    /// Forgets the cached terminal segment of `content_id`.
    pub fn evict(&self, content_id: i64) {
        self.cache.lock().pop(&content_id);
    }
}
