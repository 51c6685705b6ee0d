//! Pass-through streaming for browser-playable containers.
//!
//! Serves byte ranges straight from a [`PieceProvider`] without touching the
//! payload. Works for finished files and for torrents still downloading.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, stream};
use tracing::debug;

use super::range::{RangeRequest, resolve_range};
use super::traits::{PieceProvider, PieceProviderError};

/// Size of chunks read from the piece provider.
const CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// Delay between reads while pieces are still missing.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Attempts before a missing piece fails the response.
const MAX_NOT_READY_RETRIES: u32 = 120; // 30s at 250ms

/// Builds a 200/206/416 response streaming `provider`.
pub async fn passthrough_response(
    provider: Arc<dyn PieceProvider>,
    content_type: &str,
    headers: &HeaderMap,
) -> Response {
    let file_size = provider.size().await;

    match resolve_range(headers, file_size) {
        RangeRequest::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{file_size}"))
                    .unwrap_or_else(|_| HeaderValue::from_static("bytes */0")),
            )],
        )
            .into_response(),
        RangeRequest::Partial(range) => {
            debug!(start = range.start, end = range.end, file_size, "Serving byte range");
            let body = Body::from_stream(range_stream(provider, range.start, range.length()));

            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, range.length().to_string())
                .header(header::CONTENT_RANGE, range.content_range(file_size))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        RangeRequest::Full => {
            let body = Body::from_stream(range_stream(provider, 0, file_size));

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, file_size.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

struct RangeCursor {
    provider: Arc<dyn PieceProvider>,
    position: u64,
    end: u64,
    retries: u32,
}

/// Streams `length` bytes from `start`, waiting for pieces that are not yet
/// downloaded.
fn range_stream(
    provider: Arc<dyn PieceProvider>,
    start: u64,
    length: u64,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let cursor = RangeCursor {
        provider,
        position: start,
        end: start + length,
        retries: 0,
    };

    stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;

        loop {
            if cursor.position >= cursor.end {
                return None;
            }

            let chunk_size = (cursor.end - cursor.position).min(CHUNK_SIZE as u64) as usize;
            match cursor.provider.read_at(cursor.position, chunk_size).await {
                Ok(bytes) if bytes.is_empty() => return None,
                Ok(bytes) => {
                    cursor.position += bytes.len() as u64;
                    cursor.retries = 0;
                    return Some((Ok(bytes), Some(cursor)));
                }
                Err(PieceProviderError::NotYetAvailable)
                    if cursor.retries < MAX_NOT_READY_RETRIES =>
                {
                    cursor.retries += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return Some((Err(std::io::Error::other(e.to_string())), None));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    struct MemoryProvider {
        data: Bytes,
    }

    #[async_trait::async_trait]
    impl PieceProvider for MemoryProvider {
        async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, PieceProviderError> {
            let start = offset as usize;
            let end = (start + length).min(self.data.len());
            Ok(self.data.slice(start..end))
        }

        async fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    fn provider(len: usize) -> Arc<dyn PieceProvider> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Arc::new(MemoryProvider {
            data: Bytes::from(data),
        })
    }

    #[tokio::test]
    async fn test_full_response() {
        let response = passthrough_response(provider(1000), "video/mp4", &HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn test_partial_response() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=100-199"));

        let response = passthrough_response(provider(1000), "video/mp4", &headers).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);
        assert_eq!(body[0], 100);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=5000-"));

        let response = passthrough_response(provider(1000), "video/mp4", &headers).await;

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }
}
