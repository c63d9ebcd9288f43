mod config;
mod playback;

use std::{collections::HashMap, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    ClientBuilder,
};
use sazanami::{
    buffer::{MemorySink, SegmentSink},
    stream::{StreamEvent, TrackPreference},
    HttpClient, HttpSegmentFetcher, ManifestLoader, ManifestUpdater, MediaType, Orchestrator,
    OrchestratorCommand, OrchestratorEvent, PlaybackObservation, PlaybackObserver,
};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use url::Url;

use crate::{config::Config, playback::SimulatedPlayback};

#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
/// Play a DASH presentation against a simulated player and report what was loaded.
pub struct SazanamiArgs {
    /// Print debug logs.
    #[clap(short, long)]
    verbose: bool,

    /// Path of a TOML configuration file.
    ///
    /// Options are read from the `[streaming]` and `[playback]` tables.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Cookies used to download.
    #[clap(long)]
    cookies: Vec<String>,

    /// HTTP Header used to download.
    ///
    /// Custom header. eg. "User-Agent: xxxxxxx". This option will override --cookies.
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Position to start playback at, in seconds.
    ///
    /// Defaults to the live edge minus the suggested delay for live streams,
    /// and to the start of the first period otherwise.
    #[clap(long)]
    start_position: Option<f64>,

    /// Disable adaptation and load video of this bitrate, or the closest one below.
    #[clap(long)]
    lock_bitrate: Option<u64>,

    /// Preferred audio language.
    #[clap(long)]
    audio_language: Option<String>,

    /// Preferred text language.
    #[clap(long)]
    text_language: Option<String>,

    /// MPD url
    url: String,
}

impl SazanamiArgs {
    fn client(&self, url: &Url) -> anyhow::Result<HttpClient> {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            headers.insert(HeaderName::from_str(key.trim())?, HeaderValue::from_str(value.trim())?);
        }

        let client = HttpClient::new(
            ClientBuilder::new()
                .default_headers(headers)
                .connect_timeout(Duration::from_secs(10)),
        )?;
        client.add_cookies(self.cookies.clone(), url.clone())?;
        Ok(client)
    }

    fn preference(language: &Option<String>) -> Option<TrackPreference> {
        language.as_ref().map(|language| TrackPreference {
            language: Some(language.clone()),
            ..Default::default()
        })
    }
}

/// Reload the manifest when a stream asks for it, or every
/// `minimumUpdatePeriod` for live presentations.
async fn refresh_manifest(
    loader: Arc<ManifestLoader>,
    updater: ManifestUpdater,
    requested: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let manifest = updater.current();
        let period = manifest
            .minimum_update_period
            .filter(|_| manifest.is_dynamic)
            .map(|period| Duration::from_secs_f64(period.max(1.)));
        let scheduled = async {
            match period {
                Some(period) => tokio::time::sleep(period).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = requested.notified() => tracing::debug!("Manifest refresh requested"),
            _ = scheduled => tracing::debug!("Manifest update period elapsed"),
        }

        if let Err(error) = updater.refresh(&loader, &cancel).await {
            tracing::warn!(%error, "Failed to refresh manifest");
        }
    }
}

fn handle_event(event: OrchestratorEvent, playback: &mut SimulatedPlayback, refresh: &Notify) {
    match event {
        OrchestratorEvent::Stream { media_type, event } => match event {
            StreamEvent::AddedSegment { segment, buffered } => {
                tracing::debug!(
                    %media_type,
                    representation = segment.representation_id,
                    start = segment.start(),
                    %buffered,
                    "Segment buffered"
                );
                playback.set_buffered(media_type, buffered);
            }
            StreamEvent::Warning(error) => tracing::warn!(%media_type, %error, "Stream warning"),
            StreamEvent::Retry {
                segment,
                attempt,
                delay,
                error,
            } => tracing::warn!(
                %media_type,
                url = segment.url.as_ref().map(Url::as_str),
                attempt,
                ?delay,
                %error,
                "Segment request failed, retrying"
            ),
            StreamEvent::Discontinuity(discontinuity) => {
                tracing::info!(%media_type, ?discontinuity, "Discontinuity ahead")
            }
            StreamEvent::StreamComplete { period_id } => {
                tracing::info!(%media_type, period_id, "Period loaded")
            }
            other => tracing::trace!(%media_type, event = ?other),
        },
        OrchestratorEvent::RepresentationChange {
            media_type,
            period_id,
            adaptation_id,
            representation_id,
            bitrate,
        } => tracing::info!(
            %media_type,
            period_id,
            adaptation_id,
            representation_id,
            bitrate,
            "Representation changed"
        ),
        OrchestratorEvent::NeedsSeek { position } => playback.seek(position),
        OrchestratorEvent::NeedsFlush { media_type } => {
            tracing::info!(%media_type, "Decoder flush requested")
        }
        OrchestratorEvent::NeedsReload {
            media_type,
            position,
        } => {
            tracing::info!(%media_type, position, "Media pipeline reload requested");
            playback.clear_buffered(media_type);
            playback.seek(position);
        }
        OrchestratorEvent::NeedsManifestRefresh => refresh.notify_one(),
        OrchestratorEvent::Error { media_type, error } => {
            tracing::error!(%media_type, %error, "Stream failed")
        }
        OrchestratorEvent::Finished => tracing::info!("Every media type is loaded"),
    }
}

fn report(sinks: &HashMap<MediaType, MemorySink>) {
    let mut media_types: Vec<_> = sinks.keys().copied().collect();
    media_types.sort();
    for media_type in media_types {
        let sink = &sinks[&media_type];
        if sink.history().is_empty() {
            continue;
        }
        tracing::info!(
            %media_type,
            buffered = %sink.buffered_ranges(),
            bytes = sink.buffered_bytes(),
            pushes = sink.history().len(),
            "Loaded"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SazanamiArgs::parse();
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .try_from_env()
                .unwrap_or_else(|_| level.to_string().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref())?;
    let url = Url::parse(&args.url)?;
    let client = args.client(&url)?;

    let loader = Arc::new(ManifestLoader::new(
        client.clone(),
        &config.streaming.manifest_retry,
    ));
    let manifest = loader.load(&url, &CancellationToken::new()).await?;
    let start = args
        .start_position
        .or_else(|| manifest.live_start_position())
        .unwrap_or_else(|| manifest.periods.first().map_or(0., |p| p.start));
    tracing::info!(
        dynamic = manifest.is_dynamic,
        periods = manifest.periods.len(),
        start,
        "Manifest loaded"
    );

    let (updater, manifest) = ManifestUpdater::new(manifest);
    let (observer, observation) = PlaybackObserver::new(PlaybackObservation::at(start));
    let mut playback = SimulatedPlayback::new(observer, start, config.playback.speed);

    let fetcher = Arc::new(HttpSegmentFetcher::new(client));
    let (mut orchestrator, mut events) =
        Orchestrator::new(manifest, observation, fetcher, config.streaming);
    if let Some(preference) = SazanamiArgs::preference(&args.audio_language) {
        orchestrator = orchestrator.with_preference(MediaType::Audio, preference);
    }
    if let Some(preference) = SazanamiArgs::preference(&args.text_language) {
        orchestrator = orchestrator.with_preference(MediaType::Text, preference);
    }
    let cancel = orchestrator.cancel_token();

    let (commands, receiver) = mpsc::unbounded_channel();
    if let Some(bitrate) = args.lock_bitrate {
        commands.send(OrchestratorCommand::LockBitrate {
            media_type: MediaType::Video,
            bitrate: Some(bitrate),
        })?;
    }

    let sinks: HashMap<_, _> = MediaType::ALL
        .into_iter()
        .map(|media_type| (media_type, MemorySink::new()))
        .collect();
    let mut session = tokio::spawn(orchestrator.run(sinks, receiver));

    let refresh = Arc::new(Notify::new());
    let refresher = tokio::spawn(refresh_manifest(
        loader,
        updater,
        refresh.clone(),
        cancel.child_token(),
    ));

    let tick = config.playback.tick_interval.max(0.05);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(tick));
    let result = loop {
        tokio::select! {
            result = &mut session => break result,
            Some(event) = events.recv() => handle_event(event, &mut playback, &refresh),
            _ = ticker.tick() => playback.tick(tick),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                cancel.cancel();
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        handle_event(event, &mut playback, &refresh);
    }

    cancel.cancel();
    refresher.await?;
    drop(commands);

    let sinks = result??;
    report(&sinks);
    tracing::info!(position = playback.position(), "Session ended");

    Ok(())
}
