use std::future::Future;

use bytes::Bytes;

use super::ranges::{BufferedRanges, TimeRange};
use crate::error::BufferError;

/// Data handed to a [SegmentSink].
#[derive(Debug, Clone)]
pub struct PushedChunk {
    /// `mimeType;codecs="..."` of the data.
    pub codec: String,
    pub data: Bytes,
    /// Presentation bounds of the media. `None` for initialization data.
    pub time_range: Option<TimeRange>,
    /// Media outside of `[start, end)` is discarded by the sink.
    pub append_window: (f64, Option<f64>),
}

impl PushedChunk {
    pub fn is_init(&self) -> bool {
        self.time_range.is_none()
    }
}

/// The media buffer segments are pushed to, one per media type.
///
/// Every operation resolves with the ranges buffered once it completed.
pub trait SegmentSink: Send {
    fn push_chunk(
        &mut self,
        chunk: PushedChunk,
    ) -> impl Future<Output = Result<BufferedRanges, BufferError>> + Send;

    fn remove_buffer(
        &mut self,
        start: f64,
        end: f64,
    ) -> impl Future<Output = Result<BufferedRanges, BufferError>> + Send;

    fn buffered_ranges(&self) -> BufferedRanges;
}

impl<S> SegmentSink for Box<S>
where
    S: SegmentSink,
{
    fn push_chunk(
        &mut self,
        chunk: PushedChunk,
    ) -> impl Future<Output = Result<BufferedRanges, BufferError>> + Send {
        self.as_mut().push_chunk(chunk)
    }

    fn remove_buffer(
        &mut self,
        start: f64,
        end: f64,
    ) -> impl Future<Output = Result<BufferedRanges, BufferError>> + Send {
        self.as_mut().remove_buffer(start, end)
    }

    fn buffered_ranges(&self) -> BufferedRanges {
        self.as_ref().buffered_ranges()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRecord {
    pub codec: String,
    pub time_range: Option<TimeRange>,
    pub size: usize,
}

/// Sink keeping timing information only, the media bytes are dropped.
#[derive(Debug, Default)]
pub struct MemorySink {
    ranges: BufferedRanges,
    /// Media chunks still (at least partially) buffered, with their size.
    chunks: Vec<(TimeRange, u64)>,
    capacity: Option<u64>,
    history: Vec<PushRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse pushes once `capacity` bytes of media are held.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.chunks.iter().map(|(_, size)| size).sum()
    }

    /// Every successful push, in order.
    pub fn history(&self) -> &[PushRecord] {
        &self.history
    }

    /// Drop the media before `position`, as a player does once it is played.
    pub fn evict_before(&mut self, position: f64) {
        self.remove(f64::MIN, position);
    }

    fn remove(&mut self, start: f64, end: f64) {
        self.ranges.remove(start, end);
        let mut kept = Vec::with_capacity(self.chunks.len());
        for (range, size) in self.chunks.drain(..) {
            if range.end <= start || range.start >= end {
                kept.push((range, size));
                continue;
            }
            let remaining = TimeRange::new(range.start.max(end), range.end);
            let remaining_before = TimeRange::new(range.start, range.end.min(start));
            for part in [remaining_before, remaining] {
                if !part.is_empty() {
                    let share = part.duration() / range.duration();
                    kept.push((part, (size as f64 * share) as u64));
                }
            }
        }
        self.chunks = kept;
    }
}

impl SegmentSink for MemorySink {
    async fn push_chunk(&mut self, chunk: PushedChunk) -> Result<BufferedRanges, BufferError> {
        let size = chunk.data.len() as u64;
        if let Some(range) = chunk.time_range {
            if let Some(capacity) = self.capacity {
                if self.buffered_bytes() + size > capacity {
                    return Err(BufferError::Full);
                }
            }

            let (window_start, window_end) = chunk.append_window;
            let clipped = TimeRange::new(
                range.start.max(window_start),
                window_end.map_or(range.end, |end| range.end.min(end)),
            );
            if !clipped.is_empty() {
                self.remove(clipped.start, clipped.end);
                self.ranges.insert(clipped.start, clipped.end);
                self.chunks.push((clipped, size));
            }
        }

        self.history.push(PushRecord {
            codec: chunk.codec,
            time_range: chunk.time_range,
            size: chunk.data.len(),
        });
        Ok(self.ranges.clone())
    }

    async fn remove_buffer(&mut self, start: f64, end: f64) -> Result<BufferedRanges, BufferError> {
        self.remove(start, end);
        Ok(self.ranges.clone())
    }

    fn buffered_ranges(&self) -> BufferedRanges {
        self.ranges.clone()
    }
}
