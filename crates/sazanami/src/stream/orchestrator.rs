use std::{collections::HashMap, sync::Arc};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    adaptation::{AdaptationCommand, AdaptationStreamArgs},
    representation::StreamEnd,
    AdaptationStream, CodecSupportCache, StreamEvent, TrackPreference,
};
use crate::{
    abr::Constraints,
    buffer::SegmentSink,
    config::StreamingConfig,
    error::{SazanamiError, SazanamiResult},
    fetch::SegmentFetcher,
    manifest::{ManifestHandle, MediaType},
    observer::ObservationHandle,
    retry::RetryExecutor,
};

#[derive(Debug, Clone)]
pub enum OrchestratorCommand {
    SetAdaptation {
        media_type: MediaType,
        preference: TrackPreference,
    },
    SetConstraints {
        media_type: MediaType,
        constraints: Constraints,
    },
    LockBitrate {
        media_type: MediaType,
        /// `None` gives the choice back to the estimator.
        bitrate: Option<u64>,
    },
}

/// Everything the owner of a session may have to react to.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Stream {
        media_type: MediaType,
        event: StreamEvent,
    },
    RepresentationChange {
        media_type: MediaType,
        period_id: String,
        adaptation_id: String,
        representation_id: String,
        bitrate: u64,
    },
    /// Playback reached a hole and should continue from `position`.
    NeedsSeek { position: f64 },
    /// Decoders must drop what they hold for this media type.
    NeedsFlush { media_type: MediaType },
    /// The media pipeline must be rebuilt, then restarted at `position`.
    NeedsReload { media_type: MediaType, position: f64 },
    NeedsManifestRefresh,
    Error {
        media_type: MediaType,
        error: SazanamiError,
    },
    /// Every media type loaded its last segment.
    Finished,
}

/// Drives one [AdaptationStream] per media type of the manifest.
pub struct Orchestrator<F> {
    manifest: ManifestHandle,
    observer: ObservationHandle,
    fetcher: Arc<F>,
    config: StreamingConfig,
    retry: RetryExecutor,
    codecs: Arc<CodecSupportCache>,
    preferences: HashMap<MediaType, TrackPreference>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    cancel: CancellationToken,
}

impl<F> Orchestrator<F>
where
    F: SegmentFetcher,
{
    pub fn new(
        manifest: ManifestHandle,
        observer: ObservationHandle,
        fetcher: Arc<F>,
        config: StreamingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let orchestrator = Self {
            manifest,
            observer,
            fetcher,
            config,
            retry: RetryExecutor::new(),
            codecs: Arc::new(CodecSupportCache::permissive()),
            preferences: HashMap::new(),
            events,
            cancel: CancellationToken::new(),
        };
        (orchestrator, receiver)
    }

    pub fn with_codec_support(mut self, codecs: CodecSupportCache) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_preference(mut self, media_type: MediaType, preference: TrackPreference) -> Self {
        self.preferences.insert(media_type, preference);
        self
    }

    /// Cancelling it stops every stream of the session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until every media type is loaded, the session is cancelled or a
    /// stream fails. The sinks are given back unless a stream failed.
    pub async fn run<S>(
        self,
        mut sinks: HashMap<MediaType, S>,
        mut commands: mpsc::UnboundedReceiver<OrchestratorCommand>,
    ) -> SazanamiResult<HashMap<MediaType, S>>
    where
        S: SegmentSink + 'static,
    {
        let manifest = self.manifest.borrow().clone();
        let mut senders = HashMap::new();
        let mut running = FuturesUnordered::new();

        for media_type in MediaType::ALL {
            let present = manifest
                .periods
                .iter()
                .any(|period| !period.adaptations_of(media_type).is_empty());
            if !present {
                continue;
            }
            let Some(sink) = sinks.remove(&media_type) else {
                tracing::warn!(%media_type, "No sink for media type, skipping");
                continue;
            };

            let (sender, receiver) = mpsc::unbounded_channel();
            senders.insert(media_type, sender);
            let stream = AdaptationStream::new(AdaptationStreamArgs {
                media_type,
                manifest: self.manifest.clone(),
                observer: self.observer.clone(),
                fetcher: self.fetcher.clone(),
                config: self.config.clone(),
                retry: self.retry.clone(),
                codecs: self.codecs.clone(),
                preference: self.preferences.get(&media_type).cloned().unwrap_or_default(),
                events: self.events.clone(),
                commands: receiver,
                cancel: self.cancel.child_token(),
            });
            tracing::debug!(%media_type, "Starting adaptation stream");
            running.push(async move { (media_type, stream.run(sink).await) });
        }

        let mut failure = None;
        let mut all_finished = true;
        while !running.is_empty() {
            tokio::select! {
                biased;
                Some((media_type, outcome)) = running.next() => {
                    sinks.insert(media_type, outcome.sink);
                    senders.remove(&media_type);
                    match outcome.result {
                        Ok(StreamEnd::Finished) => {
                            tracing::info!(%media_type, "Media type fully loaded");
                        }
                        Ok(_) => all_finished = false,
                        Err(error) => {
                            all_finished = false;
                            tracing::error!(%media_type, %error, "Stream failed");
                            _ = self.events.send(OrchestratorEvent::Error {
                                media_type,
                                error: error.clone(),
                            });
                            failure.get_or_insert(error);
                            self.cancel.cancel();
                        }
                    }
                }
                Some(command) = commands.recv() => route(command, &senders),
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }
        if all_finished && !self.cancel.is_cancelled() {
            _ = self.events.send(OrchestratorEvent::Finished);
        }
        Ok(sinks)
    }
}

fn route(
    command: OrchestratorCommand,
    senders: &HashMap<MediaType, mpsc::UnboundedSender<AdaptationCommand>>,
) {
    let (media_type, command) = match command {
        OrchestratorCommand::SetAdaptation {
            media_type,
            preference,
        } => (media_type, AdaptationCommand::SetPreference(preference)),
        OrchestratorCommand::SetConstraints {
            media_type,
            constraints,
        } => (media_type, AdaptationCommand::SetConstraints(constraints)),
        OrchestratorCommand::LockBitrate {
            media_type,
            bitrate,
        } => (media_type, AdaptationCommand::LockBitrate(bitrate)),
    };
    match senders.get(&media_type) {
        Some(sender) => {
            _ = sender.send(command);
        }
        None => tracing::debug!(%media_type, "No running stream for command"),
    }
}
