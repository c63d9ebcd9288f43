use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use sazanami::{
    error::NetworkError,
    fetch::{ChunkType, FetchProgress, HttpSegmentFetcher, SegmentFetcher},
    index::Segment,
    util::range::ByteRange,
    HttpClient, SazanamiError,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::AssertWrapper;

fn segment(server: &MockServer, file: &str, byte_range: Option<ByteRange>) -> Segment {
    Segment {
        representation_id: "v1".to_string(),
        time: 4000,
        duration: 4000,
        timescale: 1000,
        timestamp_offset: 0.,
        number: Some(2),
        is_init: false,
        complete: true,
        url: Url::parse(&format!("{}/{file}", server.uri())).ok(),
        byte_range,
    }
}

#[tokio::test]
async fn test_fetch_reports_progress() {
    crate::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/2.m4s"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64 * 1024]))
        .mount(&server)
        .await;

    let fetcher = HttpSegmentFetcher::new(HttpClient::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let last_size = Arc::new(AtomicU64::new(0));
    let on_progress = {
        let calls = calls.clone();
        let last_size = last_size.clone();
        move |progress: FetchProgress| {
            calls.fetch_add(1, Ordering::Relaxed);
            last_size.store(progress.size, Ordering::Relaxed);
        }
    };

    let chunks = fetcher
        .fetch(
            &segment(&server, "v1/2.m4s", None),
            &on_progress,
            &CancellationToken::new(),
        )
        .await
        .assert_success();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Media);
    assert_eq!(chunks[0].data.len(), 64 * 1024);
    assert!(calls.load(Ordering::Relaxed) >= 1);
    assert_eq!(last_size.load(Ordering::Relaxed), 64 * 1024);
}

#[tokio::test]
async fn test_fetch_sends_range_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/single.mp4"))
        .and(header("Range", "bytes=1000-1999"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 1000]))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HttpSegmentFetcher::new(HttpClient::default());
    let chunks = fetcher
        .fetch(
            &segment(&server, "single.mp4", Some(ByteRange::new(1000, Some(1000)))),
            &|_| {},
            &CancellationToken::new(),
        )
        .await
        .assert_success();
    assert_eq!(chunks[0].offset, 1000);
    assert_eq!(chunks[0].data.len(), 1000);
}

#[tokio::test]
async fn test_fetch_maps_http_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/2.m4s"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = HttpSegmentFetcher::new(HttpClient::default());
    let error = fetcher
        .fetch(
            &segment(&server, "v1/2.m4s", None),
            &|_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match error {
        SazanamiError::Network(NetworkError::HttpStatus { status, ref url }) => {
            assert_eq!(status, 404);
            assert!(url.ends_with("/v1/2.m4s"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_fetch_timeout_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fetcher = HttpSegmentFetcher::new(HttpClient::default())
        .with_timeout(Duration::from_millis(100));
    let error = fetcher
        .fetch(
            &segment(&server, "v1/2.m4s", None),
            &|_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(error.is_retryable(), "{error:?}");
}

#[tokio::test]
async fn test_fetch_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fetcher = HttpSegmentFetcher::new(HttpClient::default());
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let result = fetcher
        .fetch(&segment(&server, "v1/2.m4s", None), &|_| {}, &cancel)
        .await;
    canceller.await.assert_success();
    assert_eq!(result, Err(SazanamiError::Cancelled));
}

#[tokio::test]
async fn test_fetch_without_url() {
    let server = MockServer::start().await;
    let mut segment = segment(&server, "v1/2.m4s", None);
    segment.url = None;

    HttpSegmentFetcher::new(HttpClient::default())
        .fetch(&segment, &|_| {}, &CancellationToken::new())
        .await
        .assert_error();
}
