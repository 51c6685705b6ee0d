//! Choosing which torrent files to play and which pieces to fetch first.

use std::ops::Range;

use crate::streaming::media_format;
use crate::torrent::TorrentFile;

/// Files picked from a torrent's file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSelection {
    pub primary: TorrentFile,
    pub subtitle: Option<TorrentFile>,
}

/// Picks the primary video and an optional subtitle file.
///
/// Returns `None` when the torrent contains no video file.
pub fn select_assets(files: &[TorrentFile]) -> Option<AssetSelection> {
    let primary = select_primary(files)?;
    let subtitle = largest(files.iter().filter(|file| {
        file.extension()
            .is_some_and(|ext| media_format::is_subtitle_extension(&ext))
    }));

    Some(AssetSelection { primary, subtitle })
}

/// Largest video file, preferring files not named as samples.
fn select_primary(files: &[TorrentFile]) -> Option<TorrentFile> {
    let videos: Vec<&TorrentFile> = files
        .iter()
        .filter(|file| {
            file.extension()
                .is_some_and(|ext| media_format::is_video_extension(&ext))
        })
        .collect();

    let features: Vec<&TorrentFile> = videos
        .iter()
        .copied()
        .filter(|file| !is_sample(file))
        .collect();

    if features.is_empty() {
        largest(videos.into_iter())
    } else {
        largest(features.into_iter())
    }
}

fn is_sample(file: &TorrentFile) -> bool {
    file.path
        .to_string_lossy()
        .to_ascii_lowercase()
        .contains("sample")
}

/// Largest file, first listed wins ties.
fn largest<'a>(files: impl Iterator<Item = &'a TorrentFile>) -> Option<TorrentFile> {
    files
        .max_by(|a, b| a.length.cmp(&b.length).then(b.index.cmp(&a.index)))
        .cloned()
}

/// Head and tail piece ranges to fetch before the rest of the file.
///
/// Players read the container header at the start and often the index at the
/// end, so each range covers `fraction` of the file's pieces (at least one).
pub fn boosted_piece_ranges(pieces: &Range<u32>, fraction: f64) -> (Range<u32>, Range<u32>) {
    let count = pieces.end.saturating_sub(pieces.start);
    if count == 0 {
        return (pieces.start..pieces.start, pieces.end..pieces.end);
    }

    let boosted = ((count as f64 * fraction.clamp(0.0, 1.0)).ceil() as u32).clamp(1, count);
    (
        pieces.start..pieces.start + boosted,
        pieces.end - boosted..pieces.end,
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn file(index: usize, path: &str, length: u64) -> TorrentFile {
        TorrentFile {
            index,
            path: PathBuf::from(path),
            length,
            pieces: 0..1,
        }
    }

    #[test]
    fn test_largest_video_is_primary() {
        let files = vec![
            file(0, "Movie/readme.nfo", 4_000_000_000),
            file(1, "Movie/movie.mkv", 1_500_000_000),
            file(2, "Movie/extras.mp4", 200_000_000),
        ];

        let selection = select_assets(&files).unwrap();
        assert_eq!(selection.primary.index, 1);
        assert!(selection.subtitle.is_none());
    }

    #[test]
    fn test_sample_is_skipped_when_feature_exists() {
        let files = vec![
            file(0, "Movie/Sample/movie-sample.mkv", 900_000_000),
            file(1, "Movie/movie.mp4", 800_000_000),
        ];

        assert_eq!(select_assets(&files).unwrap().primary.index, 1);
    }

    #[test]
    fn test_sample_only_torrent_still_plays() {
        let files = vec![file(0, "sample.mkv", 10_000_000)];

        assert_eq!(select_assets(&files).unwrap().primary.index, 0);
    }

    #[test]
    fn test_no_video_yields_none() {
        let files = vec![file(0, "album/track01.flac", 30_000_000), file(1, "cover.jpg", 1)];

        assert!(select_assets(&files).is_none());
    }

    #[test]
    fn test_largest_subtitle_is_selected() {
        let files = vec![
            file(0, "movie.mkv", 1_000),
            file(1, "subs/movie.en.srt", 80),
            file(2, "subs/movie.en.vtt", 120),
        ];

        let selection = select_assets(&files).unwrap();
        assert_eq!(selection.subtitle.map(|sub| sub.index), Some(2));
    }

    #[test]
    fn test_boosted_ranges_cover_head_and_tail() {
        let (head, tail) = boosted_piece_ranges(&(100..200), 0.10);

        assert_eq!(head, 100..110);
        assert_eq!(tail, 190..200);
    }

    #[test]
    fn test_boosted_ranges_round_up_to_one_piece() {
        let (head, tail) = boosted_piece_ranges(&(4..7), 0.10);

        assert_eq!(head, 4..5);
        assert_eq!(tail, 6..7);
    }

    #[test]
    fn test_boosted_ranges_for_empty_file() {
        let (head, tail) = boosted_piece_ranges(&(3..3), 0.10);

        assert!(head.is_empty());
        assert!(tail.is_empty());
    }
}
