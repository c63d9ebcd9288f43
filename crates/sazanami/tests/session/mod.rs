use std::{collections::HashMap, sync::Arc};

use sazanami::{
    buffer::{MemorySink, SegmentSink, TimeRange},
    config::StreamingConfig,
    stream::StreamEvent,
    HttpClient, HttpSegmentFetcher, ManifestLoader, ManifestUpdater, MediaType, Orchestrator,
    OrchestratorEvent, PlaybackObservation, PlaybackObserver,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

use crate::AssertWrapper;

const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT16S" minBufferTime="PT2S">
  <Period id="first" duration="PT8S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="4" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" />
      <Representation id="v-low" bandwidth="300000" codecs="avc1.4d401e" />
      <Representation id="v-high" bandwidth="2500000" codecs="avc1.640028" />
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="ja">
      <SegmentTemplate timescale="1" duration="4" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" />
      <Representation id="a" bandwidth="128000" codecs="mp4a.40.2" />
    </AdaptationSet>
  </Period>
  <Period id="second">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="4" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" />
      <Representation id="w-low" bandwidth="300000" codecs="avc1.4d401e" />
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="ja">
      <SegmentTemplate timescale="1" duration="4" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" />
      <Representation id="b" bandwidth="128000" codecs="mp4a.40.2" />
    </AdaptationSet>
  </Period>
</MPD>"#;

async fn serve() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MPD))
        .mount(&server)
        .await;
    // flaky once, recovered by the retry policy
    Mock::given(method("GET"))
        .and(path("/v-low/2.m4s"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/[a-z-]+/(init\.mp4|\d+\.m4s)$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_full_session() {
    crate::init_tracing();
    let server = serve().await;
    let url = Url::parse(&format!("{}/manifest.mpd", server.uri())).assert_success();

    let mut config = StreamingConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 20;
    config.buffer.tick_interval_ms = 20;

    let client = HttpClient::default();
    let loader = ManifestLoader::new(client.clone(), &config.manifest_retry);
    let manifest = loader
        .load(&url, &CancellationToken::new())
        .await
        .assert_success();
    let (_updater, manifest) = ManifestUpdater::new(manifest);
    let (_observer, observation) = PlaybackObserver::new(PlaybackObservation::at(0.));

    let fetcher = Arc::new(HttpSegmentFetcher::new(client));
    let (orchestrator, mut events) = Orchestrator::new(manifest, observation, fetcher, config);
    let (_commands, receiver) = mpsc::unbounded_channel();
    let sinks = HashMap::from([
        (MediaType::Video, MemorySink::new()),
        (MediaType::Audio, MemorySink::new()),
    ]);

    let sinks = orchestrator.run(sinks, receiver).await.assert_success();
    for media_type in [MediaType::Video, MediaType::Audio] {
        let sink = &sinks[&media_type];
        assert_eq!(
            sink.buffered_ranges().ranges(),
            &[TimeRange::new(0., 16.)],
            "{media_type}"
        );
        let inits = sink
            .history()
            .iter()
            .filter(|record| record.time_range.is_none())
            .count();
        assert_eq!(inits, 2, "{media_type}");
    }

    let mut retries = 0;
    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestratorEvent::Stream {
                event: StreamEvent::Retry { attempt, .. },
                ..
            } => {
                assert_eq!(attempt, 1);
                retries += 1;
            }
            OrchestratorEvent::Finished => finished = true,
            OrchestratorEvent::Error { error, .. } => panic!("unexpected error {error}"),
            _ => {}
        }
    }
    assert_eq!(retries, 1);
    assert!(finished);
}
