//! End-to-end acquisition scenarios driven through the pipeline facade.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, header};
use chrono::Utc;
use reelflow_core::acquisition::DownloadKey;
use reelflow_core::config::ReelflowConfig;
use reelflow_core::store::{AcquiredMedia, InMemoryStore, MediaStore};
use reelflow_core::torrent::{SimulatedTorrent, SimulatedTorrentClient, SourceLink};
use reelflow_core::{DownloadStatus, MediaPipeline, MediaResponse};
use tempfile::tempdir;

const LINK: &str = "magnet:?xt=urn:btih:4242424242424242424242424242424242424242&dn=Feature";
const MIB: u64 = 1024 * 1024;

struct Harness {
    pipeline: Arc<MediaPipeline>,
    client: Arc<SimulatedTorrentClient>,
    store: Arc<InMemoryStore>,
}

fn harness(dir: &Path) -> Harness {
    let mut config = ReelflowConfig::for_testing();
    config.storage.download_dir = dir.join("downloads");
    config.storage.streams_dir = dir.join("streams");

    let client = Arc::new(SimulatedTorrentClient::new(dir.join("downloads")));
    let store = Arc::new(InMemoryStore::new());
    let pipeline = MediaPipeline::new(config, client.clone(), store.clone()).unwrap();

    Harness {
        pipeline: Arc::new(pipeline),
        client,
        store,
    }
}

fn feature_torrent(harness: &Harness) -> SimulatedTorrent {
    let torrent = SimulatedTorrent::new([
        ("Feature/feature.mp4", 50 * MIB),
        ("Feature/feature.en.srt", 40 * 1024),
        ("Feature/sample.mp4", 2 * MIB),
    ]);
    harness
        .client
        .register(&SourceLink::parse(LINK).unwrap(), torrent.clone());
    torrent
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn range_headers(range: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::RANGE, HeaderValue::from_static(range));
    headers
}

#[tokio::test]
async fn test_download_streams_early_and_completes() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path());
    let torrent = feature_torrent(&h);
    let key = DownloadKey::new(42, "720p");

    let started = h.pipeline.get_or_start_download(42, LINK, "720p").await.unwrap();
    assert_eq!(started.status, DownloadStatus::Initializing);
    assert!(matches!(
        h.pipeline.serve_media(42, "720p", &HeaderMap::new()).await.unwrap(),
        MediaResponse::Processing(_)
    ));

    torrent.release_metadata();
    torrent.advance(6 * MIB);
    let registry = h.pipeline.registry().clone();
    eventually("streaming readiness", || {
        let registry = registry.clone();
        let key = key.clone();
        async move {
            registry
                .find(&key)
                .await
                .is_some_and(|download| download.is_streaming_ready())
        }
    })
    .await;

    let partial = h
        .pipeline
        .serve_media(42, "720p", &range_headers("bytes=0-1023"))
        .await
        .unwrap();
    match partial {
        MediaResponse::Stream(response) => assert!(response.status().is_success()),
        other => panic!("expected a stream, got {other:?}"),
    }

    torrent.complete();
    let store = h.store.clone();
    eventually("persisted media row", || {
        let store = store.clone();
        let key = key.clone();
        async move { store.acquired_media(&key).await.unwrap().is_some() }
    })
    .await;
    eventually("registry entry removal", || {
        let registry = registry.clone();
        async move { registry.in_flight_count().await == 0 }
    })
    .await;

    let row = h.store.acquired_media(&key).await.unwrap().unwrap();
    assert_eq!(row.file_size_bytes, 50 * MIB);
    assert!(row.file_path.ends_with("Feature/feature.mp4"));
    assert_eq!(row.source_link, LINK);

    let status = h.pipeline.download_status(42, "720p").await.unwrap();
    assert_eq!(status.status, DownloadStatus::Completed);
    assert_eq!(status.progress, 100.0);

    let full = h
        .pipeline
        .serve_media(42, "720p", &range_headers("bytes=0-99"))
        .await
        .unwrap();
    match full {
        MediaResponse::Stream(response) => {
            assert_eq!(response.status().as_u16(), 206);
        }
        other => panic!("expected a stream, got {other:?}"),
    }
    assert_eq!(torrent.add_count(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_acquisition() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path());
    let torrent = feature_torrent(&h);

    let registry = h.pipeline.registry().clone();

    let mut requests = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        requests.push(tokio::spawn(async move {
            registry.get_or_start(42, "720p", LINK).await
        }));
    }
    let mut downloads = Vec::new();
    for request in requests {
        downloads.push(request.await.unwrap().unwrap());
    }

    assert!(downloads.iter().all(|d| d.same_record(&downloads[0])));
    eventually("the single add", || {
        let torrent = torrent.clone();
        async move { torrent.add_count() == 1 }
    })
    .await;

    h.pipeline.registry().shutdown().await;
    assert_eq!(torrent.add_count(), 1);
}

#[tokio::test]
async fn test_stalled_download_is_retried_on_next_request() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path());
    let torrent = feature_torrent(&h);
    torrent.release_metadata();
    let registry = h.pipeline.registry().clone();

    h.pipeline.get_or_start_download(42, LINK, "720p").await.unwrap();
    eventually("the stalled entry to be dropped", || {
        let registry = registry.clone();
        async move { registry.in_flight_count().await == 0 }
    })
    .await;
    assert!(
        h.store
            .acquired_media(&DownloadKey::new(42, "720p"))
            .await
            .unwrap()
            .is_none()
    );

    let retried = h.pipeline.get_or_start_download(42, LINK, "720p").await.unwrap();
    assert_ne!(retried.status, DownloadStatus::Error);
    eventually("the second add", || {
        let torrent = torrent.clone();
        async move { torrent.add_count() == 2 }
    })
    .await;

    registry.shutdown().await;
}

#[tokio::test]
async fn test_missing_file_triggers_reacquisition() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path());
    let torrent = feature_torrent(&h);
    let key = DownloadKey::new(42, "720p");
    let now = Utc::now();

    h.store
        .upsert_acquired_media(AcquiredMedia {
            content_id: 42,
            quality: "720p".to_string(),
            file_path: dir.path().join("gone/feature.mp4"),
            source_link: LINK.to_string(),
            acquired_at: now,
            last_accessed_at: now,
            file_size_bytes: 50 * MIB,
        })
        .await
        .unwrap();

    let response = h
        .pipeline
        .serve_media(42, "720p", &HeaderMap::new())
        .await
        .unwrap();

    assert!(matches!(response, MediaResponse::Processing(_)));
    assert!(h.store.acquired_media(&key).await.unwrap().is_none());
    assert!(h.pipeline.registry().find(&key).await.is_some());
    eventually("the re-acquisition add", || {
        let torrent = torrent.clone();
        async move { torrent.add_count() == 1 }
    })
    .await;

    h.pipeline.registry().shutdown().await;
}

#[tokio::test]
async fn test_invalid_link_is_rejected_without_an_entry() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path());

    let error = h
        .pipeline
        .get_or_start_download(42, "https://example.org/feature.torrent", "720p")
        .await
        .unwrap_err();

    assert!(error.is_user_error());
    assert_eq!(h.pipeline.registry().in_flight_count().await, 0);
}
