use sazanami::{
    config::RetryConfig, index::SegmentIndex, HttpClient, ManifestLoader, ManifestUpdater,
    MediaType, SazanamiError,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::AssertWrapper;

const STATIC_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT12S" minBufferTime="PT2S">
  <Period id="0">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="4" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" />
      <Representation id="low" bandwidth="400000" codecs="avc1.4d401e" />
      <Representation id="high" bandwidth="2000000" codecs="avc1.640028" />
    </AdaptationSet>
  </Period>
</MPD>"#;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 10,
        max_delay_ms: 50,
        total_retries: 3,
    }
}

#[tokio::test]
async fn test_load_retries_server_errors() {
    crate::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(STATIC_MPD))
        .mount(&server)
        .await;

    let loader = ManifestLoader::new(HttpClient::default(), &fast_retry());
    let url = Url::parse(&format!("{}/manifest.mpd", server.uri())).assert_success();
    let manifest = loader
        .load(&url, &CancellationToken::new())
        .await
        .assert_success();

    assert!(!manifest.is_dynamic);
    let period = &manifest.periods[0];
    assert_eq!(period.end, Some(12.));
    let video = &period.adaptations_of(MediaType::Video)[0];
    assert_eq!(video.representations.len(), 2);
    assert!(matches!(
        video.representations[0].index,
        SegmentIndex::Template(_)
    ));
    let segments = video.representations[0].index.get_segments(0., 12.);
    assert_eq!(
        segments[0].url.as_ref().map(Url::path),
        Some("/low/1.m4s")
    );
}

#[tokio::test]
async fn test_load_gives_up_on_client_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let loader = ManifestLoader::new(HttpClient::default(), &fast_retry());
    let url = Url::parse(&format!("{}/manifest.mpd", server.uri())).assert_success();
    let error = loader
        .load(&url, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(error, SazanamiError::Network(_)));
}

#[tokio::test]
async fn test_load_rejects_invalid_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a manifest</html>"))
        .mount(&server)
        .await;

    let loader = ManifestLoader::new(HttpClient::default(), &fast_retry());
    let url = Url::parse(&format!("{}/manifest.mpd", server.uri())).assert_success();
    loader
        .load(&url, &CancellationToken::new())
        .await
        .assert_error();
}

#[tokio::test]
async fn test_dynamic_manifest_syncs_clock() {
    let server = MockServer::start().await;
    let mpd = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" availabilityStartTime="2020-01-01T00:00:00Z" timeShiftBufferDepth="PT30S" minimumUpdatePeriod="PT4S">
  <Period id="live" start="PT0S">
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="1" duration="2" media="a/$Number$.m4s" startNumber="0" />
      <Representation id="a" bandwidth="96000" codecs="mp4a.40.2" />
    </AdaptationSet>
  </Period>
  <UTCTiming schemeIdUri="urn:mpeg:dash:utc:http-xsdate:2014" value="{}/time" />
</MPD>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/live.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mpd))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/time"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2040-01-01T00:00:00Z"))
        .expect(1)
        .mount(&server)
        .await;

    let loader = ManifestLoader::new(HttpClient::default(), &fast_retry());
    let url = Url::parse(&format!("{}/live.mpd", server.uri())).assert_success();
    let manifest = loader
        .load(&url, &CancellationToken::new())
        .await
        .assert_success();
    assert!(manifest.is_dynamic);
    // the server clock is years ahead
    assert!(manifest.clock_offset > 86_400.);
    // 2020-01-01 to 2040-01-01
    let live_position = manifest.live_position().assert_success();
    assert!((live_position - 631_152_000.).abs() < 60.);

    // the clock is only synchronised once
    let (updater, handle) = ManifestUpdater::new(manifest);
    updater
        .refresh_from(&loader, &url, &CancellationToken::new())
        .await
        .assert_success();
    assert_eq!(handle.borrow().periods.len(), 1);
}
