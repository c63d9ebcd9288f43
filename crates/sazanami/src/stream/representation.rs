use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, stream::FuturesOrdered, FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::StreamEvent;
use crate::{
    abr::{PendingRequestsStore, ProgressInfo, RequestContent},
    buffer::{
        get_buffer_status, BufferStatusInput, BufferedChunk, ChunkQuality, Discontinuity,
        PushedChunk, SegmentInventory, SegmentSink, TimeRange,
    },
    config::BufferConfig,
    error::{BufferError, IndexError, SazanamiError, SazanamiResult},
    fetch::{ChunkType, FetchProgress, ParsedChunk, SegmentFetcher},
    index::{Segment, SegmentKey},
    manifest::{ManifestHandle, MediaType},
    observer::ObservationHandle,
    retry::{RetryExecutor, RetryOptions},
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Evaluating,
    WaitingForSegment,
    LoadingSegment,
    PushingSegment,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    /// Stop now, in-flight requests are aborted.
    Urgent,
    /// Push what is in flight, then stop.
    AfterCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Everything up to the end of the content is pushed.
    Finished,
    Terminated,
    Cancelled,
}

/// What a [RepresentationStream] hands back once it stopped.
pub struct StreamOutcome<S> {
    pub sink: S,
    pub inventory: SegmentInventory,
    pub result: SazanamiResult<StreamEnd>,
}

pub struct RepresentationStreamArgs<F, S> {
    pub media_type: MediaType,
    pub manifest: ManifestHandle,
    pub observer: ObservationHandle,
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub sink: S,
    pub inventory: SegmentInventory,
    pub fetcher: Arc<F>,
    pub retry: RetryExecutor,
    pub retry_options: RetryOptions,
    pub buffer: BufferConfig,
    pub pending: Arc<Mutex<PendingRequestsStore>>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub terminate: watch::Receiver<Option<TerminationRequest>>,
    pub cancel: CancellationToken,
}

struct LoadedSegment {
    id: u64,
    segment: Segment,
    result: SazanamiResult<Vec<ParsedChunk>>,
}

struct InFlight {
    id: u64,
    key: SegmentKey,
    start: f64,
}

/// Loads the segments of one representation of one period into a sink.
///
/// Requests run concurrently, but their data is pushed in the order the
/// segments were queued, which is ascending time order.
pub struct RepresentationStream<F, S> {
    media_type: MediaType,
    manifest: ManifestHandle,
    observer: ObservationHandle,
    period_id: String,
    adaptation_id: String,
    representation_id: String,
    sink: S,
    inventory: SegmentInventory,
    fetcher: Arc<F>,
    retry: RetryExecutor,
    retry_options: RetryOptions,
    buffer: BufferConfig,
    pending: Arc<Mutex<PendingRequestsStore>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    terminate: watch::Receiver<Option<TerminationRequest>>,
    cancel: CancellationToken,

    state: watch::Sender<SchedulerState>,
    queue: FuturesOrdered<BoxFuture<'static, LoadedSegment>>,
    /// Same order as `queue`.
    in_flight: Vec<InFlight>,
    skipped: HashSet<SegmentKey>,
    init_requested: bool,
    last_discontinuity: Option<Discontinuity>,
    refresh_requested: bool,
    completed: bool,
    backoff_until: Option<Instant>,
}

impl<F, S> RepresentationStream<F, S>
where
    F: SegmentFetcher,
    S: SegmentSink + 'static,
{
    pub fn new(args: RepresentationStreamArgs<F, S>) -> Self {
        let RepresentationStreamArgs {
            media_type,
            manifest,
            observer,
            period_id,
            adaptation_id,
            representation_id,
            sink,
            inventory,
            fetcher,
            retry,
            retry_options,
            buffer,
            pending,
            events,
            terminate,
            cancel,
        } = args;

        Self {
            media_type,
            manifest,
            observer,
            period_id,
            adaptation_id,
            representation_id,
            sink,
            inventory,
            fetcher,
            retry,
            retry_options,
            buffer,
            pending,
            events,
            terminate,
            cancel,

            state: watch::channel(SchedulerState::Idle).0,
            queue: FuturesOrdered::new(),
            in_flight: Vec::new(),
            skipped: HashSet::new(),
            init_requested: false,
            last_discontinuity: None,
            refresh_requested: false,
            completed: false,
            backoff_until: None,
        }
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub async fn run(mut self) -> StreamOutcome<S> {
        tracing::debug!(
            media_type = %self.media_type,
            period = %self.period_id,
            representation = %self.representation_id,
            "Representation stream started"
        );

        let result = match self.run_loop().await {
            Err(SazanamiError::Cancelled) => Ok(StreamEnd::Cancelled),
            result => result,
        };

        if !matches!(result, Ok(StreamEnd::Cancelled)) {
            self.set_state(SchedulerState::Terminating);
        }
        self.drop_queue();
        self.set_state(SchedulerState::Terminated);
        match &result {
            Ok(end) => tracing::debug!(
                media_type = %self.media_type,
                representation = %self.representation_id,
                ?end,
                "Representation stream stopped"
            ),
            Err(error) => tracing::error!(
                media_type = %self.media_type,
                representation = %self.representation_id,
                %error,
                "Representation stream failed"
            ),
        }

        StreamOutcome {
            sink: self.sink,
            inventory: self.inventory,
            result,
        }
    }

    async fn run_loop(&mut self) -> SazanamiResult<StreamEnd> {
        let tick = self.buffer.tick_interval();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let termination = *self.terminate.borrow_and_update();
            match termination {
                Some(TerminationRequest::Urgent) => return Ok(StreamEnd::Terminated),
                Some(TerminationRequest::AfterCurrent) if self.queue.is_empty() => {
                    return Ok(StreamEnd::Terminated)
                }
                Some(TerminationRequest::AfterCurrent) => {
                    self.set_state(SchedulerState::Terminating)
                }
                None => {
                    self.set_state(SchedulerState::Evaluating);
                    if let Some(end) = self.evaluate()? {
                        return Ok(end);
                    }
                    self.set_state(if self.queue.is_empty() {
                        SchedulerState::WaitingForSegment
                    } else {
                        SchedulerState::LoadingSegment
                    });
                }
            }

            let loaded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                Ok(()) = self.terminate.changed() => continue,
                Some(loaded) = self.queue.next(), if !self.queue.is_empty() => loaded,
                Ok(()) = self.manifest.changed() => {
                    self.refresh_requested = false;
                    continue;
                }
                Ok(()) = self.observer.changed() => continue,
                _ = tokio::time::sleep(tick) => continue,
            };
            self.handle_loaded(loaded).await?;
        }
    }

    /// Look at the buffer and queue the loads it needs.
    fn evaluate(&mut self) -> SazanamiResult<Option<StreamEnd>> {
        let manifest = self.manifest.borrow_and_update().clone();
        let observation = self.observer.borrow_and_update().clone();

        let period = manifest
            .period(&self.period_id)
            .ok_or(IndexError::NoPeriod(observation.position))?;
        let adaptation = period
            .adaptation(self.media_type, &self.adaptation_id)
            .ok_or_else(|| IndexError::NoAdaptation(self.adaptation_id.clone()))?;
        let representation = adaptation
            .representation(&self.representation_id)
            .ok_or_else(|| IndexError::NoRepresentation(self.adaptation_id.clone()))?;

        let buffered = self.sink.buffered_ranges();
        self.inventory.synchronize(&buffered);
        let status = get_buffer_status(&BufferStatusInput {
            position: observation.position,
            period,
            adaptation_id: &self.adaptation_id,
            representation,
            buffered: &buffered,
            inventory: &self.inventory,
            buffer_goal: self.buffer.wanted_buffer_ahead,
            max_buffer_ahead: self.buffer.max_buffer_ahead,
            max_buffer_size: self.buffer.max_buffer_size,
            fast_switch_threshold: self.buffer.fast_switch_threshold,
            skipped: &self.skipped,
        });

        if status.imminent_discontinuity != self.last_discontinuity {
            if let Some(discontinuity) = status.imminent_discontinuity {
                tracing::info!(
                    media_type = %self.media_type,
                    start = discontinuity.start,
                    end = discontinuity.end,
                    "Discontinuity ahead"
                );
                self.emit(StreamEvent::Discontinuity(discontinuity));
            }
            self.last_discontinuity = status.imminent_discontinuity;
        }
        if status.should_refresh_manifest && !self.refresh_requested {
            self.refresh_requested = true;
            self.emit(StreamEvent::NeedsManifestRefresh);
        }

        if !self.init_requested {
            self.init_requested = true;
            if let Some(init) = representation.index.init_segment() {
                self.enqueue(init, representation.bitrate);
            }
        }

        let backing_off = self
            .backoff_until
            .is_some_and(|until| Instant::now() < until);
        if !backing_off {
            let capacity = self.buffer.max_concurrent_requests.max(1);
            for segment in status.needed_segments {
                if self.in_flight.len() >= capacity {
                    break;
                }
                let key = segment.key();
                if self.in_flight.iter().any(|f| f.key == key) || self.skipped.contains(&key) {
                    continue;
                }
                // loading it now would push it after later media
                if self
                    .in_flight
                    .iter()
                    .any(|f| !f.key.is_init && f.start > segment.start())
                {
                    continue;
                }
                self.enqueue(segment, representation.bitrate);
            }
        }

        if !status.has_finished_loading {
            self.completed = false;
        } else if self.queue.is_empty() && !self.completed {
            self.completed = true;
            tracing::info!(
                media_type = %self.media_type,
                period = %self.period_id,
                "Every segment of the period is loaded"
            );
            self.emit(StreamEvent::StreamComplete {
                period_id: self.period_id.clone(),
            });
        }

        if self.completed && !manifest.is_dynamic && manifest.is_last_period(period) {
            return Ok(Some(StreamEnd::Finished));
        }
        Ok(None)
    }

    fn enqueue(&mut self, segment: Segment, bitrate: u64) {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let requested_at = Instant::now();
        let content = RequestContent {
            segment: segment.clone(),
            bitrate,
        };
        if !self.pending.lock().add(id, requested_at, content) {
            return;
        }

        tracing::debug!(
            media_type = %self.media_type,
            file = %segment.file_name(),
            id,
            "Requesting segment"
        );
        self.in_flight.push(InFlight {
            id,
            key: segment.key(),
            start: segment.start(),
        });
        self.emit(StreamEvent::RequestBegin {
            id,
            segment: segment.clone(),
        });

        let fetcher = self.fetcher.clone();
        let retry = self.retry.clone();
        let options = self.retry_options.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let last_progress = Arc::new(Mutex::new(None::<FetchProgress>));

        let on_progress = {
            let last_progress = last_progress.clone();
            let pending = pending.clone();
            let events = events.clone();
            move |progress: FetchProgress| {
                *last_progress.lock() = Some(progress);
                pending.lock().add_progress(
                    id,
                    ProgressInfo {
                        size: progress.size,
                        total_size: progress.total_size,
                        duration: progress.duration,
                        timestamp: Instant::now(),
                    },
                );
                _ = events.send(StreamEvent::RequestProgress { id, progress });
            }
        };

        let load = async move {
            let result = retry
                .run(
                    |_| fetcher.fetch(&segment, &on_progress, &cancel),
                    &options,
                    SazanamiError::is_retryable,
                    |error, attempt, delay| {
                        _ = events.send(StreamEvent::Retry {
                            segment: segment.clone(),
                            attempt,
                            delay,
                            error: error.clone(),
                        });
                    },
                    &cancel,
                )
                .await;

            pending.lock().remove(id);
            _ = events.send(StreamEvent::RequestEnd { id });
            if let Ok(chunks) = &result {
                if !segment.is_init {
                    let size = chunks.iter().map(|c| c.data.len() as u64).sum();
                    let duration = last_progress
                        .lock()
                        .map_or_else(|| requested_at.elapsed(), |p| p.duration);
                    _ = events.send(StreamEvent::Metrics {
                        id,
                        size,
                        duration,
                        segment_duration: segment.duration_secs(),
                    });
                }
            }

            LoadedSegment {
                id,
                segment,
                result,
            }
        };
        self.queue.push_back(load.boxed());
    }

    async fn handle_loaded(&mut self, loaded: LoadedSegment) -> SazanamiResult<()> {
        let LoadedSegment {
            id,
            segment,
            result,
        } = loaded;
        self.in_flight.retain(|f| f.id != id);

        let chunks = match result {
            Ok(chunks) => chunks,
            Err(error) => {
                if !error.is_cancelled() {
                    tracing::error!(
                        media_type = %self.media_type,
                        file = %segment.file_name(),
                        %error,
                        "Failed to load segment"
                    );
                }
                return Err(error);
            }
        };

        let manifest = self.manifest.borrow().clone();
        let period = manifest
            .period(&self.period_id)
            .ok_or(IndexError::NoPeriod(segment.start()))?;
        let representation = period
            .adaptation(self.media_type, &self.adaptation_id)
            .and_then(|adaptation| adaptation.representation(&self.representation_id))
            .ok_or_else(|| IndexError::NoRepresentation(self.adaptation_id.clone()))?;
        let codec = representation.codec_string();
        let append_window = (period.start, period.end);

        self.set_state(SchedulerState::PushingSegment);
        // media bytes of this segment already in the sink
        let mut pushed_size = 0;
        for chunk in chunks {
            let time_range = (chunk.chunk_type == ChunkType::Media)
                .then(|| TimeRange::new(segment.start(), segment.end()));
            let size = chunk.data.len() as u64;
            let pushed = PushedChunk {
                codec: codec.clone(),
                data: chunk.data,
                time_range,
                append_window,
            };

            let buffered = match self.sink.push_chunk(pushed).await {
                Ok(buffered) => buffered,
                Err(BufferError::Full) => {
                    tracing::warn!(
                        media_type = %self.media_type,
                        file = %segment.file_name(),
                        "Buffer full, waiting for playback to consume it"
                    );
                    self.discard_partial(&segment, pushed_size).await?;
                    self.backoff_until = Some(Instant::now() + self.buffer.tick_interval());
                    self.drop_queue();
                    self.emit(StreamEvent::Warning(BufferError::Full.into()));
                    return Ok(());
                }
                Err(BufferError::Corrupt(reason)) if !segment.is_init => {
                    tracing::warn!(
                        media_type = %self.media_type,
                        file = %segment.file_name(),
                        %reason,
                        "Skipping corrupted segment"
                    );
                    self.discard_partial(&segment, pushed_size).await?;
                    self.skipped.insert(segment.key());
                    self.emit(StreamEvent::Warning(BufferError::Corrupt(reason).into()));
                    self.emit(StreamEvent::Discontinuity(Discontinuity {
                        start: segment.start(),
                        end: segment.end(),
                    }));
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            };

            if let Some(range) = time_range {
                pushed_size += size;
                let (window_start, window_end) = append_window;
                let clipped = TimeRange::new(
                    range.start.max(window_start),
                    window_end.map_or(range.end, |end| range.end.min(end)),
                );
                self.inventory.insert(BufferedChunk {
                    quality: ChunkQuality {
                        adaptation_id: self.adaptation_id.clone(),
                        representation_id: self.representation_id.clone(),
                        bitrate: representation.bitrate,
                    },
                    segment: range,
                    buffered: clipped,
                    size: pushed_size,
                });
                self.inventory.synchronize(&buffered);
            }
        }

        tracing::debug!(
            media_type = %self.media_type,
            file = %segment.file_name(),
            "Segment pushed"
        );
        self.emit(StreamEvent::AddedSegment {
            segment,
            buffered: self.sink.buffered_ranges(),
        });
        Ok(())
    }

    /// Remove the chunks of `segment` pushed before one of its later chunks was refused.
    async fn discard_partial(&mut self, segment: &Segment, pushed_size: u64) -> SazanamiResult<()> {
        if pushed_size == 0 {
            return Ok(());
        }
        tracing::debug!(
            media_type = %self.media_type,
            file = %segment.file_name(),
            "Removing partially pushed segment"
        );
        let buffered = self.sink.remove_buffer(segment.start(), segment.end()).await?;
        self.inventory.remove(segment.start(), segment.end());
        self.inventory.synchronize(&buffered);
        Ok(())
    }

    /// Abort every queued load. Their data is never pushed.
    fn drop_queue(&mut self) {
        self.queue = FuturesOrdered::new();
        let mut pending = self.pending.lock();
        for in_flight in self.in_flight.drain(..) {
            if in_flight.key.is_init {
                self.init_requested = false;
            }
            if pending.remove(in_flight.id).is_some() {
                _ = self.events.send(StreamEvent::RequestEnd { id: in_flight.id });
            }
        }
    }

    fn set_state(&mut self, state: SchedulerState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::trace!(media_type = %self.media_type, ?state, "Scheduler state changed");
            self.emit(StreamEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: StreamEvent) {
        _ = self.events.send(event);
    }
}
