use std::{collections::HashSet, pin::pin, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    orchestrator::OrchestratorEvent,
    representation::{RepresentationStreamArgs, StreamEnd, StreamOutcome, TerminationRequest},
    switch::{get_switch_action, CodecSupportCache, SwitchAction, SwitchContext},
    RepresentationStream, StreamEvent,
};
use crate::{
    abr::{
        Constraints, EstimatorInput, PendingRequestsStore, RepresentationChoice,
        RepresentationEstimator,
    },
    buffer::{BufferedRanges, Discontinuity, SegmentInventory, SegmentSink},
    config::StreamingConfig,
    error::{BufferError, ErrorKind, IndexError, SazanamiError, SazanamiResult},
    fetch::SegmentFetcher,
    index::ROUNDING_ERROR,
    manifest::{Adaptation, ManifestHandle, MediaType, Period, Representation},
    observer::ObservationHandle,
    retry::RetryExecutor,
};

/// Which track of a media type to play.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackPreference {
    pub adaptation_id: Option<String>,
    /// BCP 47 tag, only the primary language is compared.
    pub language: Option<String>,
    pub audio_description: bool,
    pub closed_caption: bool,
}

fn primary_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

impl TrackPreference {
    pub fn choose<'a>(&self, adaptations: &'a [Arc<Adaptation>]) -> Option<&'a Arc<Adaptation>> {
        if let Some(id) = &self.adaptation_id {
            if let Some(adaptation) = adaptations.iter().find(|a| &a.id == id) {
                return Some(adaptation);
            }
        }

        let accessibility = |a: &&Arc<Adaptation>| {
            a.is_audio_description == self.audio_description
                && a.is_closed_caption == self.closed_caption
        };
        if let Some(language) = &self.language {
            let language = primary_language(language);
            let same_language = |a: &&Arc<Adaptation>| {
                a.language
                    .as_deref()
                    .is_some_and(|l| primary_language(l).eq_ignore_ascii_case(language))
            };
            if let Some(adaptation) = adaptations
                .iter()
                .filter(same_language)
                .find(accessibility)
                .or_else(|| adaptations.iter().find(same_language))
            {
                return Some(adaptation);
            }
        }

        adaptations
            .iter()
            .find(accessibility)
            .or_else(|| adaptations.first())
    }
}

/// Commands understood by an [AdaptationStream].
#[derive(Debug, Clone)]
pub enum AdaptationCommand {
    SetPreference(TrackPreference),
    SetConstraints(Constraints),
    LockBitrate(Option<u64>),
}

pub struct AdaptationStreamArgs<F> {
    pub media_type: MediaType,
    pub manifest: ManifestHandle,
    pub observer: ObservationHandle,
    pub fetcher: Arc<F>,
    pub config: StreamingConfig,
    pub retry: RetryExecutor,
    pub codecs: Arc<CodecSupportCache>,
    pub preference: TrackPreference,
    pub events: mpsc::UnboundedSender<OrchestratorEvent>,
    pub commands: mpsc::UnboundedReceiver<AdaptationCommand>,
    pub cancel: CancellationToken,
}

/// What the next representation stream loads.
#[derive(Debug, Clone)]
struct Target {
    period_id: String,
    /// Chosen by the estimator when `None`.
    representation_id: Option<String>,
}

struct Selection {
    period: Arc<Period>,
    adaptation: Arc<Adaptation>,
    representation: Arc<Representation>,
}

/// Result of preparing the sink for a new selection.
enum Switch {
    Ready,
    /// Playback moved elsewhere while waiting, load this instead.
    Retarget(Target),
    Cancelled,
}

/// What the running representation stream is replaced with once it stops.
#[derive(Default)]
struct Handoff {
    next: Option<Target>,
    /// Every segment of the running period is loaded.
    completed: bool,
}

/// Loads one media type, one period after the other.
///
/// Exactly one [RepresentationStream] runs at a time. It is replaced when the
/// estimator picks another representation, when the period is loaded, when
/// the track preference changes or when the position jumps to another
/// period. The old stream always stops before the new one gets the sink.
pub struct AdaptationStream<F> {
    media_type: MediaType,
    manifest: ManifestHandle,
    observer: ObservationHandle,
    fetcher: Arc<F>,
    config: StreamingConfig,
    retry: RetryExecutor,
    codecs: Arc<CodecSupportCache>,
    preference: TrackPreference,
    estimator: RepresentationEstimator,
    pending: Arc<Mutex<PendingRequestsStore>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    commands: mpsc::UnboundedReceiver<AdaptationCommand>,
    cancel: CancellationToken,

    blacklist: HashSet<String>,
    discontinuities: Vec<Discontinuity>,
    /// Last ranges reported by the sink.
    buffered: BufferedRanges,
    /// An index error asked for a refresh, and nothing was loaded since.
    index_error_retried: bool,
}

impl<F> AdaptationStream<F>
where
    F: SegmentFetcher,
{
    pub fn new(args: AdaptationStreamArgs<F>) -> Self {
        let estimator = RepresentationEstimator::new(&args.config.abr);
        Self {
            media_type: args.media_type,
            manifest: args.manifest,
            observer: args.observer,
            fetcher: args.fetcher,
            config: args.config,
            retry: args.retry,
            codecs: args.codecs,
            preference: args.preference,
            estimator,
            pending: Arc::new(Mutex::new(PendingRequestsStore::new())),
            events: args.events,
            commands: args.commands,
            cancel: args.cancel,

            blacklist: HashSet::new(),
            discontinuities: Vec::new(),
            buffered: BufferedRanges::new(),
            index_error_retried: false,
        }
    }

    pub async fn run<S>(mut self, mut sink: S) -> StreamOutcome<S>
    where
        S: SegmentSink + 'static,
    {
        let mut inventory = SegmentInventory::new(self.media_type);
        let mut previous: Option<Arc<Representation>> = None;
        let mut target = match self.initial_target() {
            Ok(target) => target,
            Err(error) => return finish(sink, inventory, Err(error)),
        };

        loop {
            if self.cancel.is_cancelled() {
                return finish(sink, inventory, Ok(StreamEnd::Cancelled));
            }

            let selection = match self.select(&target, previous.as_deref()) {
                Ok(Some(selection)) => selection,
                Ok(None) => {
                    // nothing of this media type in the period
                    let manifest = self.manifest.borrow().clone();
                    let next = manifest
                        .period(&target.period_id)
                        .and_then(|period| manifest.next_period(period));
                    match next {
                        Some(next) => {
                            target = Target {
                                period_id: next.id.clone(),
                                representation_id: None,
                            };
                        }
                        None if !manifest.is_dynamic => {
                            return finish(sink, inventory, Ok(StreamEnd::Finished))
                        }
                        None => {
                            if !self.wait_for_manifest().await {
                                return finish(sink, inventory, Ok(StreamEnd::Cancelled));
                            }
                        }
                    }
                    continue;
                }
                Err(error) => return finish(sink, inventory, Err(error)),
            };

            if let Some(previous) = previous.as_deref() {
                if previous.id != selection.representation.id {
                    let result = self
                        .switch_buffer(previous, &selection, &mut sink, &mut inventory)
                        .await;
                    match result {
                        Ok(Switch::Ready) => {}
                        Ok(Switch::Retarget(next)) => {
                            target = next;
                            continue;
                        }
                        Ok(Switch::Cancelled) => {
                            return finish(sink, inventory, Ok(StreamEnd::Cancelled))
                        }
                        Err(error) => return finish(sink, inventory, Err(error)),
                    }
                }
            }

            tracing::info!(
                media_type = %self.media_type,
                period = %selection.period.id,
                adaptation = %selection.adaptation.id,
                representation = %selection.representation.id,
                bitrate = selection.representation.bitrate,
                "Loading representation"
            );
            self.emit(OrchestratorEvent::RepresentationChange {
                media_type: self.media_type,
                period_id: selection.period.id.clone(),
                adaptation_id: selection.adaptation.id.clone(),
                representation_id: selection.representation.id.clone(),
                bitrate: selection.representation.bitrate,
            });

            let (handoff, outcome) = self.drive(&selection, sink, inventory).await;
            sink = outcome.sink;
            inventory = outcome.inventory;
            self.buffered = sink.buffered_ranges();
            previous = Some(selection.representation.clone());

            match outcome.result {
                Ok(StreamEnd::Finished) => {
                    return finish(sink, inventory, Ok(StreamEnd::Finished))
                }
                Ok(StreamEnd::Cancelled) => {
                    return finish(sink, inventory, Ok(StreamEnd::Cancelled))
                }
                Ok(StreamEnd::Terminated) => {
                    target = handoff.next.unwrap_or_else(|| Target {
                        period_id: selection.period.id.clone(),
                        representation_id: Some(selection.representation.id.clone()),
                    });
                }
                Err(error) if is_representation_failure(&error) => {
                    tracing::warn!(
                        media_type = %self.media_type,
                        representation = %selection.representation.id,
                        %error,
                        "Representation failed, falling back"
                    );
                    self.blacklist.insert(selection.representation.id.clone());
                    let Some(fallback) = self.fallback(&selection) else {
                        return finish(sink, inventory, Err(error));
                    };
                    self.emit(OrchestratorEvent::Stream {
                        media_type: self.media_type,
                        event: StreamEvent::Warning(error),
                    });
                    target = Target {
                        period_id: selection.period.id.clone(),
                        representation_id: Some(fallback.id.clone()),
                    };
                }
                Err(error) if error.kind() == ErrorKind::Index => {
                    if self.index_error_retried {
                        return finish(sink, inventory, Err(error));
                    }
                    tracing::warn!(
                        media_type = %self.media_type,
                        %error,
                        "Index error, waiting for a manifest refresh"
                    );
                    self.index_error_retried = true;
                    self.emit(OrchestratorEvent::NeedsManifestRefresh);
                    if !self.wait_for_manifest().await {
                        let result = if self.cancel.is_cancelled() {
                            Ok(StreamEnd::Cancelled)
                        } else {
                            Err(error)
                        };
                        return finish(sink, inventory, result);
                    }
                    target = Target {
                        period_id: selection.period.id.clone(),
                        representation_id: Some(selection.representation.id.clone()),
                    };
                }
                Err(error) => return finish(sink, inventory, Err(error)),
            }
        }
    }

    /// Run one representation stream until it stops, reacting to what happens meanwhile.
    async fn drive<S>(
        &mut self,
        selection: &Selection,
        sink: S,
        inventory: SegmentInventory,
    ) -> (Handoff, StreamOutcome<S>)
    where
        S: SegmentSink + 'static,
    {
        let (terminate, terminate_receiver) = watch::channel(None);
        let (stream_events, mut stream_receiver) = mpsc::unbounded_channel();
        let stream = RepresentationStream::new(RepresentationStreamArgs {
            media_type: self.media_type,
            manifest: self.manifest.clone(),
            observer: self.observer.clone(),
            period_id: selection.period.id.clone(),
            adaptation_id: selection.adaptation.id.clone(),
            representation_id: selection.representation.id.clone(),
            sink,
            inventory,
            fetcher: self.fetcher.clone(),
            retry: self.retry.clone(),
            retry_options: self.config.retry.to_options(),
            buffer: self.config.buffer.clone(),
            pending: self.pending.clone(),
            events: stream_events,
            terminate: terminate_receiver,
            cancel: self.cancel.child_token(),
        });
        let mut running = pin!(stream.run());
        let mut handoff = Handoff::default();

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut running => break outcome,
                Some(event) = stream_receiver.recv() => {
                    self.on_stream_event(event, selection, &terminate, &mut handoff)
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command, selection, &terminate, &mut handoff)
                }
                Ok(()) = self.observer.changed() => {
                    self.on_observation(selection, &terminate, &mut handoff)
                }
                Ok(()) = self.manifest.changed() => {
                    self.on_manifest_update(selection, &terminate, &mut handoff)
                }
            }
        };

        while let Ok(event) = stream_receiver.try_recv() {
            self.on_stream_event(event, selection, &terminate, &mut handoff);
        }
        (handoff, outcome)
    }

    fn on_stream_event(
        &mut self,
        event: StreamEvent,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        match &event {
            StreamEvent::Metrics { size, duration, .. } => {
                self.estimator
                    .add_sample(duration.as_secs_f64() * 1000., *size);
                self.reestimate(selection, terminate, handoff);
            }
            StreamEvent::AddedSegment { segment, buffered } => {
                self.buffered = buffered.clone();
                if !segment.is_init {
                    self.index_error_retried = false;
                }
            }
            StreamEvent::Discontinuity(discontinuity) => {
                self.discontinuities.push(*discontinuity);
                self.check_discontinuities();
            }
            StreamEvent::NeedsManifestRefresh => {
                self.emit(OrchestratorEvent::NeedsManifestRefresh);
            }
            StreamEvent::StreamComplete { .. } => {
                handoff.completed = true;
                self.move_to_next_period(selection, terminate, handoff);
            }
            _ => {}
        }
        self.emit(OrchestratorEvent::Stream {
            media_type: self.media_type,
            event,
        });
    }

    fn on_command(
        &mut self,
        command: AdaptationCommand,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        tracing::debug!(media_type = %self.media_type, ?command, "Command received");
        match command {
            AdaptationCommand::SetPreference(preference) => {
                self.preference = preference;
                let manifest = self.manifest.borrow().clone();
                let chosen = manifest.period(&selection.period.id).and_then(|period| {
                    self.preference
                        .choose(period.adaptations_of(self.media_type))
                        .map(|a| a.id.clone())
                });
                if chosen.is_some_and(|id| id != selection.adaptation.id) {
                    handoff.next.get_or_insert_with(|| Target {
                        period_id: selection.period.id.clone(),
                        representation_id: None,
                    });
                    terminate.send_replace(Some(TerminationRequest::Urgent));
                }
            }
            AdaptationCommand::SetConstraints(constraints) => {
                self.estimator.set_constraints(constraints);
                self.reestimate(selection, terminate, handoff);
            }
            AdaptationCommand::LockBitrate(bitrate) => {
                self.estimator.lock_bitrate(bitrate);
                self.reestimate(selection, terminate, handoff);
            }
        }
    }

    fn on_observation(
        &mut self,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        self.check_discontinuities();

        let position = self.observer.borrow_and_update().position;
        let period = &selection.period;
        let outside = position < period.start - ROUNDING_ERROR
            || period.end.is_some_and(|end| position >= end - ROUNDING_ERROR);
        if outside && self.buffered.range_containing(position).is_none() {
            let manifest = self.manifest.borrow().clone();
            if let Some(seeked) = manifest.period_for(position) {
                if seeked.id != period.id {
                    tracing::info!(
                        media_type = %self.media_type,
                        position,
                        period = %seeked.id,
                        "Position moved to another period"
                    );
                    handoff.next = Some(Target {
                        period_id: seeked.id.clone(),
                        representation_id: None,
                    });
                    terminate.send_replace(Some(TerminationRequest::Urgent));
                    return;
                }
            }
        }

        self.reestimate(selection, terminate, handoff);
    }

    fn on_manifest_update(
        &mut self,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        // a live period may get a successor once it is completely loaded
        if handoff.completed {
            self.move_to_next_period(selection, terminate, handoff);
        }
    }

    fn move_to_next_period(
        &mut self,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        if handoff.next.is_some() {
            return;
        }
        let manifest = self.manifest.borrow().clone();
        let Some(next) = manifest
            .period(&selection.period.id)
            .and_then(|period| manifest.next_period(period))
        else {
            return;
        };

        tracing::debug!(
            media_type = %self.media_type,
            period = %next.id,
            "Moving to the next period"
        );
        handoff.next = Some(Target {
            period_id: next.id.clone(),
            representation_id: None,
        });
        terminate.send_replace(Some(TerminationRequest::AfterCurrent));
    }

    fn reestimate(
        &mut self,
        selection: &Selection,
        terminate: &watch::Sender<Option<TerminationRequest>>,
        handoff: &mut Handoff,
    ) {
        if handoff.next.is_some() {
            return;
        }
        let manifest = self.manifest.borrow().clone();
        let Some(adaptation) = manifest
            .period(&selection.period.id)
            .and_then(|period| period.adaptation(self.media_type, &selection.adaptation.id))
        else {
            return;
        };

        let candidates = self.playable(adaptation);
        let Some(choice) = self.estimate(&candidates, Some(selection.representation.as_ref()))
        else {
            return;
        };
        if choice.representation.id == selection.representation.id {
            return;
        }

        tracing::info!(
            media_type = %self.media_type,
            from = %selection.representation.id,
            to = %choice.representation.id,
            bandwidth = ?choice.bandwidth,
            reason = ?choice.reason,
            "Switching representation"
        );
        handoff.next = Some(Target {
            period_id: selection.period.id.clone(),
            representation_id: Some(choice.representation.id.clone()),
        });
        terminate.send_replace(Some(if choice.urgent {
            TerminationRequest::Urgent
        } else {
            TerminationRequest::AfterCurrent
        }));
    }

    fn estimate(
        &mut self,
        candidates: &[Arc<Representation>],
        current: Option<&Representation>,
    ) -> Option<RepresentationChoice> {
        let observation = self.observer.borrow().clone();
        let pending = self.pending.lock();
        self.estimator.estimate(&EstimatorInput {
            representations: candidates,
            current,
            buffer_gap: observation.buffered.gap_from(observation.position),
            speed: observation.speed,
            pending: &pending,
        })
    }

    /// Representations neither blacklisted nor refused by the codec probe, by ascending bitrate.
    fn playable(&self, adaptation: &Adaptation) -> Vec<Arc<Representation>> {
        let mut playable: Vec<_> = adaptation
            .representations
            .iter()
            .filter(|r| !self.blacklist.contains(&r.id))
            .filter(|r| self.codecs.is_supported(&r.codec_string()))
            .cloned()
            .collect();
        playable.sort_by_key(|r| r.bitrate);
        playable
    }

    /// The best representation under the failed one, or the lowest one left.
    fn fallback(&self, failed: &Selection) -> Option<Arc<Representation>> {
        let manifest = self.manifest.borrow().clone();
        let adaptation = manifest
            .period(&failed.period.id)
            .and_then(|period| period.adaptation(self.media_type, &failed.adaptation.id))?;
        let playable = self.playable(adaptation);
        playable
            .iter()
            .rev()
            .find(|r| r.bitrate < failed.representation.bitrate)
            .or_else(|| playable.first())
            .cloned()
    }

    fn initial_target(&self) -> SazanamiResult<Target> {
        let manifest = self.manifest.borrow().clone();
        let position = self.observer.borrow().position;
        let period = manifest
            .period_for(position)
            .or_else(|| {
                manifest
                    .periods
                    .first()
                    .filter(|first| position < first.start)
            })
            .ok_or(IndexError::NoPeriod(position))?;
        Ok(Target {
            period_id: period.id.clone(),
            representation_id: None,
        })
    }

    /// Resolve `target` against the current manifest. `None` when the period
    /// has nothing of this media type.
    fn select(
        &mut self,
        target: &Target,
        previous: Option<&Representation>,
    ) -> SazanamiResult<Option<Selection>> {
        let manifest = self.manifest.borrow().clone();
        let position = self.observer.borrow().position;
        let period = manifest
            .period(&target.period_id)
            .cloned()
            .ok_or(IndexError::NoPeriod(position))?;

        let adaptations = period.adaptations_of(self.media_type);
        if adaptations.is_empty() {
            return Ok(None);
        }
        let adaptation = self
            .preference
            .choose(adaptations)
            .cloned()
            .ok_or_else(|| IndexError::NoAdaptation(self.media_type.to_string()))?;

        let candidates = self.playable(&adaptation);
        let requested = target
            .representation_id
            .as_ref()
            .and_then(|id| candidates.iter().find(|r| &r.id == id))
            .cloned();
        let representation = match requested {
            Some(representation) => representation,
            None => self
                .estimate(&candidates, previous)
                .map(|choice| choice.representation)
                .ok_or_else(|| IndexError::NoRepresentation(adaptation.id.clone()))?,
        };

        Ok(Some(Selection {
            period,
            adaptation,
            representation,
        }))
    }

    /// Keep, clean or drop the buffered content before `selection` starts loading.
    ///
    /// A reload for a period playback has not reached yet waits for the
    /// position to enter it, the sink still holds what is being played.
    async fn switch_buffer<S>(
        &mut self,
        previous: &Representation,
        selection: &Selection,
        sink: &mut S,
        inventory: &mut SegmentInventory,
    ) -> SazanamiResult<Switch>
    where
        S: SegmentSink,
    {
        let mut position = self.observer.borrow().position;
        let mut action = self.switch_action(previous, selection, &sink.buffered_ranges(), position);
        if action == SwitchAction::NeedsReload
            && selection.period.start > position + ROUNDING_ERROR
        {
            tracing::debug!(
                media_type = %self.media_type,
                period = %selection.period.id,
                "Delaying reload until playback reaches the period"
            );
            position = match self.wait_for_period(&selection.period).await {
                PeriodWait::Reached(position) => position,
                PeriodWait::Moved(target) => return Ok(Switch::Retarget(target)),
                PeriodWait::Cancelled => return Ok(Switch::Cancelled),
            };
            action = self.switch_action(previous, selection, &sink.buffered_ranges(), position);
        }
        tracing::debug!(media_type = %self.media_type, ?action, "Switch action");

        match action {
            SwitchAction::Continue => {}
            SwitchAction::CleanBuffer(ranges) => {
                for range in ranges {
                    sink.remove_buffer(range.start, range.end).await?;
                    inventory.remove(range.start, range.end);
                }
            }
            SwitchAction::FlushBuffer(ranges) => {
                for range in ranges {
                    sink.remove_buffer(range.start, range.end).await?;
                    inventory.remove(range.start, range.end);
                }
                self.emit(OrchestratorEvent::NeedsFlush {
                    media_type: self.media_type,
                });
            }
            SwitchAction::NeedsReload => {
                sink.remove_buffer(f64::MIN, f64::MAX).await?;
                inventory.reset();
                self.emit(OrchestratorEvent::NeedsReload {
                    media_type: self.media_type,
                    position,
                });
            }
        }
        self.buffered = sink.buffered_ranges();
        Ok(Switch::Ready)
    }

    fn switch_action(
        &self,
        previous: &Representation,
        selection: &Selection,
        buffered: &BufferedRanges,
        position: f64,
    ) -> SwitchAction {
        get_switch_action(&SwitchContext {
            previous,
            next: &selection.representation,
            policy: self.config.on_codec_switch,
            switch_point: position.max(selection.period.start),
            position,
            period_end: selection.period.end,
            buffered,
        })
    }

    /// Wait for the position to enter `period`.
    ///
    /// Gives up when playback jumps to media that is not buffered in another period.
    async fn wait_for_period(&mut self, period: &Period) -> PeriodWait {
        loop {
            let position = self.observer.borrow_and_update().position;
            if position >= period.start - ROUNDING_ERROR {
                return PeriodWait::Reached(position);
            }
            if self.buffered.range_containing(position).is_none() {
                let manifest = self.manifest.borrow().clone();
                if let Some(seeked) = manifest.period_for(position).filter(|p| p.id != period.id) {
                    return PeriodWait::Moved(Target {
                        period_id: seeked.id.clone(),
                        representation_id: None,
                    });
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PeriodWait::Cancelled,
                changed = self.observer.changed() => {
                    if changed.is_err() {
                        return PeriodWait::Cancelled;
                    }
                }
            }
        }
    }

    /// Ask for a seek over the holes playback reached.
    fn check_discontinuities(&mut self) {
        let position = self.observer.borrow().position;
        let mut seek_to = None;
        self.discontinuities.retain(|discontinuity| {
            if position >= discontinuity.end {
                return false;
            }
            if position >= discontinuity.start - ROUNDING_ERROR {
                seek_to = Some(discontinuity.end);
                return false;
            }
            true
        });
        if let Some(position) = seek_to {
            tracing::info!(media_type = %self.media_type, position, "Jumping over a discontinuity");
            self.emit(OrchestratorEvent::NeedsSeek { position });
        }
    }

    /// Resolves `false` when cancelled or when the manifest is gone.
    async fn wait_for_manifest(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            changed = self.manifest.changed() => changed.is_ok(),
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        _ = self.events.send(event);
    }
}

enum PeriodWait {
    Reached(f64),
    Moved(Target),
    Cancelled,
}

fn finish<S>(
    sink: S,
    inventory: SegmentInventory,
    result: SazanamiResult<StreamEnd>,
) -> StreamOutcome<S> {
    StreamOutcome {
        sink,
        inventory,
        result,
    }
}

/// Failures another representation of the same adaptation may not have.
fn is_representation_failure(error: &SazanamiError) -> bool {
    matches!(
        error,
        SazanamiError::Network(_) | SazanamiError::Buffer(BufferError::CodecMismatch(_))
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        buffer::{MemorySink, TimeRange},
        config::CodecSwitchPolicy,
        error::NetworkError,
        manifest::{Manifest, ManifestUpdater},
        observer::{PlaybackObservation, PlaybackObserver},
        test_util::{static_manifest, video_period, MockFetcher},
    };

    struct Harness {
        updater: ManifestUpdater,
        observer: PlaybackObserver,
        events: mpsc::UnboundedReceiver<OrchestratorEvent>,
        commands: mpsc::UnboundedSender<AdaptationCommand>,
    }

    impl Harness {
        fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn new_stream(
        manifest: Manifest,
        fetcher: Arc<MockFetcher>,
        config: StreamingConfig,
    ) -> (AdaptationStream<MockFetcher>, Harness) {
        let (updater, manifest) = ManifestUpdater::new(manifest);
        let (observer, observation) = PlaybackObserver::new(PlaybackObservation::at(0.));
        let (events, receiver) = mpsc::unbounded_channel();
        let (commands, command_receiver) = mpsc::unbounded_channel();

        let stream = AdaptationStream::new(AdaptationStreamArgs {
            media_type: MediaType::Video,
            manifest,
            observer: observation,
            fetcher,
            config,
            retry: RetryExecutor::with_seed(3),
            codecs: Arc::new(CodecSupportCache::permissive()),
            preference: TrackPreference::default(),
            events,
            commands: command_receiver,
            cancel: CancellationToken::new(),
        });
        let harness = Harness {
            updater,
            observer,
            events: receiver,
            commands,
        };
        (stream, harness)
    }

    fn media_ranges(sink: &MemorySink) -> Vec<(f64, f64)> {
        sink.history()
            .iter()
            .filter_map(|record| record.time_range.map(|r| (r.start, r.end)))
            .collect()
    }

    fn representation_changes(events: &[OrchestratorEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                OrchestratorEvent::RepresentationChange {
                    representation_id, ..
                } => Some(representation_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_track_preference() {
        let adaptation = |id: &str, language: &str, audio_description: bool| {
            Arc::new(Adaptation {
                id: id.to_string(),
                media_type: MediaType::Audio,
                language: Some(language.to_string()),
                is_audio_description: audio_description,
                is_closed_caption: false,
                representations: vec![],
            })
        };
        let adaptations = vec![
            adaptation("ja", "ja", false),
            adaptation("en-ad", "en", true),
            adaptation("en", "en-US", false),
        ];

        let chosen = |preference: TrackPreference| {
            preference
                .choose(&adaptations)
                .map(|a| a.id.clone())
                .unwrap()
        };
        assert_eq!(chosen(TrackPreference::default()), "ja");
        assert_eq!(
            chosen(TrackPreference {
                language: Some("en".to_string()),
                ..Default::default()
            }),
            "en"
        );
        assert_eq!(
            chosen(TrackPreference {
                language: Some("en-GB".to_string()),
                audio_description: true,
                ..Default::default()
            }),
            "en-ad"
        );
        assert_eq!(
            chosen(TrackPreference {
                adaptation_id: Some("en-ad".to_string()),
                ..Default::default()
            }),
            "en-ad"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_through_periods() {
        let manifest = static_manifest(vec![
            video_period("p0", 0., 20., &[("v", 1_000_000, "avc1.64001f")]),
            video_period("p1", 20., 40., &[("v", 1_000_000, "avc1.64001f")]),
        ]);
        let (stream, mut harness) =
            new_stream(manifest, MockFetcher::new(1_000), StreamingConfig::default());

        let outcome = stream.run(MemorySink::new()).await;
        assert_eq!(outcome.result, Ok(StreamEnd::Finished));
        let expected: Vec<_> = (0..10).map(|i| (i as f64 * 4., i as f64 * 4. + 4.)).collect();
        assert_eq!(media_ranges(&outcome.sink), expected);

        let events = harness.drain_events();
        assert_eq!(representation_changes(&events), vec!["p0-v", "p1-v"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_on_network_failure() {
        let manifest = static_manifest(vec![video_period(
            "p0",
            0.,
            20.,
            &[
                ("low", 500_000, "avc1.4d401e"),
                ("mid", 1_500_000, "avc1.4d401f"),
                ("high", 3_000_000, "avc1.640028"),
            ],
        )]);
        let fetcher = MockFetcher::new(1_000);
        let forbidden = NetworkError::HttpStatus {
            status: 403,
            url: "https://cdn.test/p0-high/1.m4s".to_string(),
        };
        fetcher.fail("p0-high/1.m4s", forbidden.into(), 1);
        let mut config = StreamingConfig::default();
        config.abr.initial_bitrate = 3_000_000;
        let (stream, mut harness) = new_stream(manifest, fetcher, config);

        let outcome = stream.run(MemorySink::new()).await;
        assert_eq!(outcome.result, Ok(StreamEnd::Finished));
        assert_eq!(
            media_ranges(&outcome.sink),
            vec![(0., 4.), (4., 8.), (8., 12.), (12., 16.), (16., 20.)]
        );
        let events = harness.drain_events();
        assert_eq!(representation_changes(&events), vec!["p0-high", "p0-mid"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_without_fallback() {
        let manifest = static_manifest(vec![video_period(
            "p0",
            0.,
            20.,
            &[("v", 1_000_000, "avc1.64001f")],
        )]);
        let fetcher = MockFetcher::new(1_000);
        let not_found = SazanamiError::from(NetworkError::HttpStatus {
            status: 404,
            url: "https://cdn.test/p0-v/0.m4s".to_string(),
        });
        fetcher.fail("p0-v/0.m4s", not_found.clone(), 1);
        let (stream, _harness) = new_stream(manifest, fetcher, StreamingConfig::default());

        let outcome = stream.run(MemorySink::new()).await;
        assert_eq!(outcome.result, Err(not_found));
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_error_waits_for_refresh() {
        let manifest = || {
            static_manifest(vec![video_period(
                "p0",
                0.,
                20.,
                &[("v", 1_000_000, "avc1.64001f")],
            )])
        };
        let missing = SazanamiError::from(IndexError::SegmentNotFound {
            representation_id: "p0-v".to_string(),
            time: 4.,
        });

        // resolved by the refresh
        let fetcher = MockFetcher::new(1_000);
        fetcher.fail("p0-v/1.m4s", missing.clone(), 1);
        let (stream, mut harness) = new_stream(manifest(), fetcher, StreamingConfig::default());
        let handle = tokio::spawn(stream.run(MemorySink::new()));
        loop {
            match harness.events.recv().await {
                Some(OrchestratorEvent::NeedsManifestRefresh) => break,
                Some(_) => continue,
                None => panic!("no refresh requested"),
            }
        }
        harness.updater.update(manifest());
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result, Ok(StreamEnd::Finished));

        // not resolved by the refresh
        let fetcher = MockFetcher::new(1_000);
        fetcher.fail("p0-v/1.m4s", missing.clone(), 2);
        let (stream, mut harness) = new_stream(manifest(), fetcher, StreamingConfig::default());
        let handle = tokio::spawn(stream.run(MemorySink::new()));
        loop {
            match harness.events.recv().await {
                Some(OrchestratorEvent::NeedsManifestRefresh) => break,
                Some(_) => continue,
                None => panic!("no refresh requested"),
            }
        }
        harness.updater.update(manifest());
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result, Err(missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_bitrate_switches_representation() {
        let manifest = static_manifest(vec![video_period(
            "p0",
            0.,
            20.,
            &[("low", 500_000, "avc1.4d401e"), ("high", 3_000_000, "avc1.640028")],
        )]);
        let fetcher = MockFetcher::new(1_000);
        for number in 0..5 {
            fetcher.delay(&format!("p0-high/{number}.m4s"), Duration::from_secs(1));
        }
        let mut config = StreamingConfig::default();
        config.abr.initial_bitrate = 3_000_000;
        let (stream, mut harness) = new_stream(manifest, fetcher, config);

        let handle = tokio::spawn(stream.run(MemorySink::new()));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        harness
            .commands
            .send(AdaptationCommand::LockBitrate(Some(500_000)))
            .unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result, Ok(StreamEnd::Finished));
        let events = harness.drain_events();
        assert_eq!(representation_changes(&events), vec!["p0-high", "p0-low"]);
        let ranges = media_ranges(&outcome.sink);
        assert_eq!(ranges.first(), Some(&(0., 4.)));
        assert_eq!(ranges.last(), Some(&(16., 20.)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_period_reloads_once_reached() {
        let manifest = static_manifest(vec![
            video_period("p0", 0., 20., &[("avc", 1_000_000, "avc1.64001f")]),
            video_period("p1", 20., 40., &[("hevc", 1_000_000, "hvc1.1.6.L93.B0")]),
        ]);
        let config = StreamingConfig {
            on_codec_switch: CodecSwitchPolicy::Reload,
            ..StreamingConfig::default()
        };
        let (stream, mut harness) = new_stream(manifest, MockFetcher::new(1_000), config);
        let handle = tokio::spawn(stream.run(MemorySink::new()));

        let mut buffered = BufferedRanges::new();
        loop {
            match harness.events.recv().await {
                Some(OrchestratorEvent::Stream {
                    event: StreamEvent::AddedSegment { buffered: b, .. },
                    ..
                }) => buffered = b,
                Some(OrchestratorEvent::Stream {
                    event: StreamEvent::StreamComplete { .. },
                    ..
                }) => break,
                Some(_) => continue,
                None => panic!("first period never completed"),
            }
        }
        assert_eq!(buffered.ranges(), &[TimeRange::new(0., 20.)]);

        // playback is still in the first period, its media must stay
        tokio::time::sleep(Duration::from_secs(10)).await;
        let events = harness.drain_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::NeedsReload { .. })));
        assert!(representation_changes(&events).is_empty());
        assert!(!handle.is_finished());

        harness.observer.set_position(20.);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result, Ok(StreamEnd::Finished));
        let events = harness.drain_events();
        let reloads: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::NeedsReload { position, .. } => Some(*position),
                _ => None,
            })
            .collect();
        assert_eq!(reloads, vec![20.]);
        assert_eq!(representation_changes(&events), vec!["p1-hevc"]);
        assert_eq!(
            outcome.sink.buffered_ranges().ranges(),
            &[TimeRange::new(20., 40.)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting_for_reload() {
        let manifest = static_manifest(vec![
            video_period("p0", 0., 20., &[("avc", 1_000_000, "avc1.64001f")]),
            video_period("p1", 20., 40., &[("hevc", 1_000_000, "hvc1.1.6.L93.B0")]),
        ]);
        let config = StreamingConfig {
            on_codec_switch: CodecSwitchPolicy::Reload,
            ..StreamingConfig::default()
        };
        let (stream, mut harness) = new_stream(manifest, MockFetcher::new(1_000), config);
        let cancel = stream.cancel.clone();
        let handle = tokio::spawn(stream.run(MemorySink::new()));

        loop {
            match harness.events.recv().await {
                Some(OrchestratorEvent::Stream {
                    event: StreamEvent::StreamComplete { .. },
                    ..
                }) => break,
                Some(_) => continue,
                None => panic!("first period never completed"),
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.result, Ok(StreamEnd::Cancelled));
        assert_eq!(
            outcome.sink.buffered_ranges().ranges(),
            &[TimeRange::new(0., 20.)]
        );
        let events = harness.drain_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::NeedsReload { .. })));
    }
}
