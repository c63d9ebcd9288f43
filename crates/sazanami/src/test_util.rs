use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    buffer::{BufferedRanges, MemorySink, PushedChunk, SegmentSink},
    error::{BufferError, SazanamiError, SazanamiResult},
    fetch::{ChunkType, FetchProgress, ParsedChunk, ProgressReporter, SegmentFetcher},
    index::{IndexContext, InitSegmentInfo, Segment, SegmentIndex, TimelineEntry, TimelineIndex},
    manifest::{Adaptation, Manifest, MediaType, Period, Representation},
};

pub(crate) const SEGMENT_DURATION: u64 = 4;

/// Fetcher answering from memory, with scripted delays and failures.
#[derive(Default)]
pub(crate) struct MockFetcher {
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, VecDeque<SazanamiError>>>,
    splits: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
    size: usize,
}

impl MockFetcher {
    pub(crate) fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            ..Default::default()
        })
    }

    pub(crate) fn delay(&self, file: &str, delay: Duration) {
        self.delays.lock().insert(file.to_string(), delay);
    }

    pub(crate) fn fail(&self, file: &str, error: SazanamiError, times: usize) {
        self.failures
            .lock()
            .entry(file.to_string())
            .or_default()
            .extend(std::iter::repeat(error).take(times));
    }

    /// Answer `file` with `chunks` media chunks instead of one.
    pub(crate) fn split(&self, file: &str, chunks: usize) {
        self.splits.lock().insert(file.to_string(), chunks.max(1));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

fn path_of(segment: &Segment) -> String {
    segment
        .url
        .as_ref()
        .map(|url| url.path().trim_start_matches('/').to_string())
        .unwrap_or_else(|| segment.file_name())
}

impl SegmentFetcher for MockFetcher {
    async fn fetch(
        &self,
        segment: &Segment,
        on_progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> SazanamiResult<Vec<ParsedChunk>> {
        let path = path_of(segment);
        self.calls.lock().push(path.clone());

        let delay = self
            .delays
            .lock()
            .get(&path)
            .copied()
            .unwrap_or(Duration::from_millis(100));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SazanamiError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        let failure = self
            .failures
            .lock()
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        on_progress(FetchProgress {
            size: self.size as u64,
            total_size: Some(self.size as u64),
            duration: delay,
        });
        if segment.is_init {
            return Ok(vec![ParsedChunk {
                chunk_type: ChunkType::Init,
                data: Bytes::from(vec![0; self.size]),
                offset: 0,
            }]);
        }
        let count = self.splits.lock().get(&path).copied().unwrap_or(1);
        let chunk_size = self.size / count;
        Ok((0..count)
            .map(|i| ParsedChunk {
                chunk_type: ChunkType::Media,
                data: Bytes::from(vec![0; chunk_size]),
                offset: (i * chunk_size) as u64,
            })
            .collect())
    }
}

/// [MemorySink] rejecting the media chunks starting at chosen positions, once.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSink {
    pub(crate) inner: MemorySink,
    /// Chunks to accept first, and the error refusing the next one.
    failures: HashMap<i64, (usize, BufferError)>,
}

impl ScriptedSink {
    pub(crate) fn new(inner: MemorySink) -> Self {
        Self {
            inner,
            failures: HashMap::new(),
        }
    }

    pub(crate) fn fail_at(self, start: f64, error: BufferError) -> Self {
        self.fail_chunk_at(start, 0, error)
    }

    /// Refuse the chunk number `index` of the segment starting at `start`.
    pub(crate) fn fail_chunk_at(mut self, start: f64, index: usize, error: BufferError) -> Self {
        self.failures.insert(millis(start), (index, error));
        self
    }
}

fn millis(position: f64) -> i64 {
    (position * 1000.).round() as i64
}

impl SegmentSink for ScriptedSink {
    async fn push_chunk(&mut self, chunk: PushedChunk) -> Result<BufferedRanges, BufferError> {
        let mut failure = None;
        if let Some(range) = chunk.time_range {
            let key = millis(range.start);
            if let Some((accepted, _)) = self.failures.get_mut(&key) {
                if *accepted > 0 {
                    *accepted -= 1;
                } else {
                    failure = self.failures.remove(&key).map(|(_, error)| error);
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => self.inner.push_chunk(chunk).await,
        }
    }

    async fn remove_buffer(&mut self, start: f64, end: f64) -> Result<BufferedRanges, BufferError> {
        self.inner.remove_buffer(start, end).await
    }

    fn buffered_ranges(&self) -> BufferedRanges {
        self.inner.buffered_ranges()
    }
}

/// Representation of 4 second segments served from `https://cdn.test/{id}/`.
pub(crate) fn timeline_representation(
    id: &str,
    bitrate: u64,
    codec: &str,
    period_start: f64,
    period_end: f64,
) -> Arc<Representation> {
    let count = ((period_end - period_start) / SEGMENT_DURATION as f64).ceil() as i64;
    let mut context = IndexContext::new(id, 1).with_period(period_start, Some(period_end));
    context.bandwidth = bitrate;
    context.init = Some(InitSegmentInfo {
        url: Url::parse(&format!("https://cdn.test/{id}/init.mp4")).ok(),
        byte_range: None,
    });

    Arc::new(Representation {
        id: id.to_string(),
        bitrate,
        codec: Some(codec.to_string()),
        mime_type: Some("video/mp4".to_string()),
        width: None,
        height: None,
        index: SegmentIndex::Timeline(TimelineIndex::new(
            context,
            vec![TimelineEntry::new(0, SEGMENT_DURATION, count - 1)],
            Some(0),
            Some(format!("https://cdn.test/{id}/$Number$.m4s")),
        )),
    })
}

pub(crate) fn video_period(
    id: &str,
    start: f64,
    end: f64,
    representations: &[(&str, u64, &str)],
) -> Period {
    let representations = representations
        .iter()
        .map(|(rep_id, bitrate, codec)| {
            timeline_representation(&format!("{id}-{rep_id}"), *bitrate, codec, start, end)
        })
        .collect();
    Period {
        id: id.to_string(),
        start,
        end: Some(end),
        adaptations: HashMap::from([(
            MediaType::Video,
            vec![Arc::new(Adaptation {
                id: "video".to_string(),
                media_type: MediaType::Video,
                language: None,
                is_audio_description: false,
                is_closed_caption: false,
                representations,
            })],
        )]),
    }
}

/// Add an `audio` adaptation, built like the ones of [video_period].
pub(crate) fn with_audio(mut period: Period, representations: &[(&str, u64, &str)]) -> Period {
    let end = period.end.unwrap_or(period.start);
    let representations = representations
        .iter()
        .map(|(rep_id, bitrate, codec)| {
            let id = format!("{}-{rep_id}", period.id);
            let video = timeline_representation(&id, *bitrate, codec, period.start, end);
            Arc::new(Representation {
                mime_type: Some("audio/mp4".to_string()),
                ..(*video).clone()
            })
        })
        .collect();
    period.adaptations.insert(
        MediaType::Audio,
        vec![Arc::new(Adaptation {
            id: "audio".to_string(),
            media_type: MediaType::Audio,
            language: Some("en".to_string()),
            is_audio_description: false,
            is_closed_caption: false,
            representations,
        })],
    );
    period
}

pub(crate) fn static_manifest(periods: Vec<Period>) -> Manifest {
    Manifest {
        url: None,
        is_dynamic: false,
        availability_start_time: 0.,
        time_shift_buffer_depth: None,
        clock_offset: 0.,
        suggested_presentation_delay: None,
        minimum_update_period: None,
        periods: periods.into_iter().map(Arc::new).collect(),
        live: None,
    }
}
