//! Transcode gateway: picks pass-through or transcoding per container.

use std::path::Path;
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{debug, info};

use super::direct_stream::passthrough_response;
use super::file_provider::FileProvider;
use super::media_format::{self, ContainerClass};
use super::traits::PieceProvider;
use super::transcode_stream::{TranscodeInput, transcode_response};
use super::{StreamingError, StreamingResult};
use crate::config::TranscodeConfig;

/// Serves media files to browsers.
///
/// Failures are local to the single response; the gateway holds no shared
/// state beyond its configuration.
#[derive(Debug, Clone)]
pub struct TranscodeGateway {
    config: TranscodeConfig,
}

impl TranscodeGateway {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Serves a file that is completely on disk.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotFound` - File does not exist
    /// - `StreamingError::UnsupportedFormat` - Container is neither native nor transcodable
    /// - `StreamingError::TranscoderFailure` - Transcoder could not be started
    /// - `StreamingError::Io` - File could not be opened
    pub async fn serve_file(&self, path: &Path, headers: &HeaderMap) -> StreamingResult<Response> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => {
                return Err(StreamingError::NotFound {
                    path: path.to_path_buf(),
                });
            }
        }

        match media_format::classify(path) {
            ContainerClass::Native => {
                debug!(path = %path.display(), "Serving file as pass-through");
                let provider = FileProvider::open(path)
                    .await
                    .map_err(|source| StreamingError::Io {
                        operation: format!("open {}", path.display()),
                        source,
                    })?;
                Ok(passthrough_response(
                    Arc::new(provider),
                    &media_format::content_type(path),
                    headers,
                )
                .await)
            }
            ContainerClass::Transcode => {
                info!(path = %path.display(), "Transcoding file for browser playback");
                transcode_response(&self.config, TranscodeInput::File(path.to_path_buf()))
            }
            ContainerClass::Unsupported => Err(StreamingError::UnsupportedFormat {
                format: media_format::extension(path),
            }),
        }
    }

    /// Serves a file still being downloaded through its torrent reader.
    ///
    /// `file_name` decides the container class; the caller has already
    /// checked the download is streaming-ready.
    ///
    /// # Errors
    ///
    /// - `StreamingError::UnsupportedFormat` - Container is neither native nor transcodable
    /// - `StreamingError::TranscoderFailure` - Transcoder could not be started
    pub async fn serve_partial(
        &self,
        provider: Arc<dyn PieceProvider>,
        file_name: &str,
        headers: &HeaderMap,
    ) -> StreamingResult<Response> {
        let path = Path::new(file_name);

        match media_format::classify(path) {
            ContainerClass::Native => {
                debug!(file_name, "Serving partial download as pass-through");
                Ok(passthrough_response(provider, &media_format::content_type(path), headers).await)
            }
            ContainerClass::Transcode => {
                info!(file_name, "Transcoding partial download for browser playback");
                transcode_response(&self.config, TranscodeInput::Provider(provider))
            }
            ContainerClass::Unsupported => Err(StreamingError::UnsupportedFormat {
                format: media_format::extension(path),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::{StatusCode, header};
    use tempfile::tempdir;

    use super::*;

    fn gateway_with(program: &str, args: &[&str]) -> TranscodeGateway {
        TranscodeGateway::new(TranscodeConfig {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..TranscodeConfig::default()
        })
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let gateway = TranscodeGateway::new(TranscodeConfig::default());

        let result = gateway
            .serve_file(&dir.path().join("gone.mp4"), &HeaderMap::new())
            .await;
        assert!(matches!(result, Err(StreamingError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_container_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.rar");
        std::fs::write(&path, b"archive").unwrap();
        let gateway = TranscodeGateway::new(TranscodeConfig::default());

        let result = gateway.serve_file(&path, &HeaderMap::new()).await;
        assert!(matches!(
            result,
            Err(StreamingError::UnsupportedFormat { format }) if format == "rar"
        ));
    }

    #[tokio::test]
    async fn test_native_container_is_passed_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        let gateway = TranscodeGateway::new(TranscodeConfig::default());

        let response = gateway.serve_file(&path, &HeaderMap::new()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 4096);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcoded_output_is_streamed_from_stdout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"matroska payload").unwrap();
        let gateway = gateway_with("cat", &["{input}"]);

        let response = gateway.serve_file(&path, &HeaderMap::new()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"matroska payload");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_transcoder_fails_the_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.avi");
        std::fs::write(&path, b"avi payload").unwrap();
        let gateway = gateway_with("false", &[]);

        let response = gateway.serve_file(&path, &HeaderMap::new()).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await;

        assert!(body.is_err());
    }

    #[tokio::test]
    async fn test_missing_transcoder_binary_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"payload").unwrap();
        let gateway = gateway_with("reelflow-no-such-transcoder", &["{input}"]);

        let result = gateway.serve_file(&path, &HeaderMap::new()).await;
        assert!(matches!(
            result,
            Err(StreamingError::TranscoderFailure { .. })
        ));
    }
}
