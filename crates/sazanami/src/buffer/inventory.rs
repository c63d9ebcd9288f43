use super::ranges::{BufferedRanges, TimeRange};
use crate::{index::ROUNDING_ERROR, manifest::MediaType};

/// Chunks shrunk by less than this are still considered complete.
const GARBAGE_COLLECTION_TOLERANCE: f64 = 0.5;

/// Which encoding a buffered chunk was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkQuality {
    pub adaptation_id: String,
    pub representation_id: String,
    pub bitrate: u64,
}

/// One segment present, at least partially, in the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedChunk {
    pub quality: ChunkQuality,
    /// Bounds announced by the segment index.
    pub segment: TimeRange,
    /// Bounds currently occupied in the sink.
    pub buffered: TimeRange,
    pub size: u64,
}

impl BufferedChunk {
    /// Whether the whole segment is still in the sink.
    pub fn is_complete(&self) -> bool {
        self.buffered.start - self.segment.start < GARBAGE_COLLECTION_TOLERANCE
            && self.segment.end - self.buffered.end < GARBAGE_COLLECTION_TOLERANCE
    }

    fn carve(&self, start: f64, end: f64) -> Vec<BufferedChunk> {
        let mut parts = Vec::with_capacity(2);
        let duration = self.buffered.duration().max(ROUNDING_ERROR);
        for (part_start, part_end) in [
            (self.buffered.start, start.min(self.buffered.end)),
            (end.max(self.buffered.start), self.buffered.end),
        ] {
            let range = TimeRange::new(part_start, part_end);
            if range.is_empty() {
                continue;
            }
            let mut part = self.clone();
            part.buffered = range;
            part.size = (self.size as f64 * range.duration() / duration) as u64;
            parts.push(part);
        }
        parts
    }
}

/// Which chunk of which representation occupies which part of one sink.
#[derive(Debug, Clone)]
pub struct SegmentInventory {
    media_type: MediaType,
    /// Chronological, non-overlapping.
    chunks: Vec<BufferedChunk>,
}

impl SegmentInventory {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            chunks: Vec::new(),
        }
    }

    pub fn chunks(&self) -> &[BufferedChunk] {
        &self.chunks
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    /// Record a pushed chunk. Whatever it overlaps is replaced.
    pub fn insert(&mut self, chunk: BufferedChunk) {
        if chunk.buffered.is_empty() {
            tracing::warn!(
                media_type = %self.media_type,
                range = %chunk.buffered,
                "Ignoring empty chunk"
            );
            return;
        }
        self.remove(chunk.buffered.start, chunk.buffered.end);
        let position = self
            .chunks
            .partition_point(|c| c.buffered.start < chunk.buffered.start);
        self.chunks.insert(position, chunk);
    }

    /// Forget `[start, end)`.
    pub fn remove(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            if chunk.buffered.end <= start + ROUNDING_ERROR
                || chunk.buffered.start >= end - ROUNDING_ERROR
            {
                kept.push(chunk);
            } else {
                kept.extend(chunk.carve(start, end));
            }
        }
        self.chunks = kept;
    }

    /// Align the inventory with what the sink reports, dropping chunks
    /// it evicted and shrinking those it partially evicted.
    pub fn synchronize(&mut self, buffered: &BufferedRanges) {
        let media_type = self.media_type;
        self.chunks.retain_mut(|chunk| {
            let overlaps = buffered.intersection(chunk.buffered.start, chunk.buffered.end);
            let (Some(first), Some(last)) = (overlaps.first(), overlaps.last()) else {
                tracing::debug!(
                    %media_type,
                    range = %chunk.buffered,
                    "Chunk garbage collected"
                );
                return false;
            };
            // the size follows the share of the chunk still in the sink
            let duration = chunk.buffered.duration().max(ROUNDING_ERROR);
            let remaining: f64 = overlaps.iter().map(TimeRange::duration).sum();
            chunk.size = (chunk.size as f64 * (remaining / duration).min(1.)) as u64;
            chunk.buffered = TimeRange::new(first.start, last.end);
            !chunk.buffered.is_empty()
        });
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Chunks overlapping `[start, end)`, in chronological order.
    pub fn chunks_in(&self, start: f64, end: f64) -> impl Iterator<Item = &BufferedChunk> {
        self.chunks.iter().filter(move |c| {
            c.buffered.end > start + ROUNDING_ERROR && c.buffered.start < end - ROUNDING_ERROR
        })
    }
}
