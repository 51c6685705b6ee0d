//! Container classification by file extension.
//!
//! Decides whether a file can be handed to the browser as-is, must be piped
//! through the transcoder, or cannot be served at all.

use std::path::Path;

/// Containers browsers play natively.
pub const NATIVE_EXTENSIONS: &[&str] = &["mp4", "m4v", "webm", "ogg", "ogv"];

/// Containers the transcoder converts to fragmented MP4.
pub const TRANSCODE_EXTENSIONS: &[&str] = &[
    "mkv", "avi", "mov", "wmv", "flv", "mpg", "mpeg", "ts", "m2ts", "3gp",
];

/// Subtitle files picked up alongside the primary asset.
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt"];

/// How a container is delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerClass {
    /// Served byte-for-byte with range support
    Native,
    /// Piped through the external transcoder
    Transcode,
    /// Not a video container Reelflow knows how to serve
    Unsupported,
}

/// Classifies a lowercased extension.
pub fn classify_extension(extension: &str) -> ContainerClass {
    if NATIVE_EXTENSIONS.contains(&extension) {
        ContainerClass::Native
    } else if TRANSCODE_EXTENSIONS.contains(&extension) {
        ContainerClass::Transcode
    } else {
        ContainerClass::Unsupported
    }
}

/// Classifies a path by its extension, case-insensitively.
pub fn classify(path: &Path) -> ContainerClass {
    classify_extension(&extension(path))
}

/// Lowercased extension of `path`, empty when there is none.
pub fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// True for any container the pipeline can play, natively or transcoded.
pub fn is_video_extension(extension: &str) -> bool {
    classify_extension(extension) != ContainerClass::Unsupported
}

pub fn is_subtitle_extension(extension: &str) -> bool {
    SUBTITLE_EXTENSIONS.contains(&extension)
}

/// MIME type announced for pass-through responses.
pub fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_extension() {
        assert_eq!(classify(Path::new("movie.mp4")), ContainerClass::Native);
        assert_eq!(classify(Path::new("Movie.WEBM")), ContainerClass::Native);
        assert_eq!(classify(Path::new("movie.mkv")), ContainerClass::Transcode);
        assert_eq!(classify(Path::new("movie.AVI")), ContainerClass::Transcode);
        assert_eq!(classify(Path::new("notes.txt")), ContainerClass::Unsupported);
        assert_eq!(classify(Path::new("no_extension")), ContainerClass::Unsupported);
    }

    #[test]
    fn test_content_type_for_native_containers() {
        assert_eq!(content_type(Path::new("movie.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("movie.webm")), "video/webm");
    }

    #[test]
    fn test_subtitles_are_not_video() {
        assert!(is_subtitle_extension("srt"));
        assert!(!is_video_extension("srt"));
        assert!(is_video_extension("mkv"));
    }
}
