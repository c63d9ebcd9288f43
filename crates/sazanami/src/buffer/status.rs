//! Decides which segments a scheduler has to load next.
//!
//! [get_buffer_status] is a pure function of its input: it performs no I/O and
//! mutates nothing, so the same input always gives the same output.
use std::collections::HashSet;

use super::{
    inventory::{BufferedChunk, SegmentInventory},
    ranges::{BufferedRanges, MAX_GAP},
};
use crate::{
    index::{AvailableBound, Segment, SegmentKey, ROUNDING_ERROR},
    manifest::{Period, Representation},
};

/// Buffered content starting before `position + PLAYING_MARGIN` is never replaced.
const PLAYING_MARGIN: f64 = 1.2;

/// Without a fast-switch threshold, content is only replaced by a
/// representation at least this many times its bitrate.
const REPLACEMENT_RATIO: f64 = 1.5;

pub struct BufferStatusInput<'a> {
    pub position: f64,
    pub period: &'a Period,
    pub adaptation_id: &'a str,
    pub representation: &'a Representation,
    pub buffered: &'a BufferedRanges,
    pub inventory: &'a SegmentInventory,
    /// Seconds to load ahead of the position.
    pub buffer_goal: f64,
    pub max_buffer_ahead: Option<f64>,
    /// Bytes the sink may hold.
    pub max_buffer_size: Option<u64>,
    /// Bitrate under which buffered content is replaced by any better representation.
    pub fast_switch_threshold: Option<f64>,
    /// Segments given up on, never requested again.
    pub skipped: &'a HashSet<SegmentKey>,
}

/// A hole of the timeline playback has to jump over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Discontinuity {
    pub start: f64,
    /// Where media resumes.
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferStatus {
    pub imminent_discontinuity: Option<Discontinuity>,
    /// Every segment up to the end of the period is buffered.
    pub has_finished_loading: bool,
    /// In ascending time order.
    pub needed_segments: Vec<Segment>,
    pub should_refresh_manifest: bool,
    pub is_buffer_full: bool,
}

impl BufferStatusInput<'_> {
    /// Whether `chunk` may stay in the buffer instead of being loaded again.
    fn is_acceptable(&self, chunk: &BufferedChunk) -> bool {
        if chunk.buffered.start < self.position + PLAYING_MARGIN {
            return true;
        }
        if chunk.quality.adaptation_id != self.adaptation_id {
            return false;
        }
        if chunk.quality.representation_id == self.representation.id {
            return true;
        }

        let buffered = chunk.quality.bitrate as f64;
        let wanted = self.representation.bitrate as f64;
        match self.fast_switch_threshold {
            Some(threshold) => !(buffered < threshold && wanted > buffered),
            None => wanted <= buffered * REPLACEMENT_RATIO,
        }
    }

    /// End of the acceptable media buffered without interruption from the position.
    fn acceptable_end(&self) -> f64 {
        let Some(buffered_end) = self.buffered.contiguous_end_from(self.position) else {
            return self.position;
        };

        let mut end = self.position;
        for chunk in self.inventory.chunks_in(self.position, buffered_end) {
            if chunk.buffered.start > end + MAX_GAP || !self.is_acceptable(chunk) {
                break;
            }
            end = end.max(chunk.buffered.end);
        }
        end.min(buffered_end)
    }

    fn is_buffered(&self, segment: &Segment) -> bool {
        let mut covered_until = segment.start();
        for chunk in self.inventory.chunks_in(segment.start(), segment.end()) {
            if chunk.buffered.start > covered_until + MAX_GAP || !self.is_acceptable(chunk) {
                return false;
            }
            covered_until = covered_until.max(chunk.buffered.end);
        }
        covered_until >= segment.end() - MAX_GAP
    }

    fn estimated_size(&self, segment: &Segment) -> u64 {
        (segment.duration_secs() * self.representation.bitrate as f64 / 8.) as u64
    }
}

/// Evaluate what a scheduler should do for the current state of its buffer.
pub fn get_buffer_status(input: &BufferStatusInput<'_>) -> BufferStatus {
    let index = &input.representation.index;
    let period = input.period;
    let position = input.position.max(period.start);

    let wanted_start = input.acceptable_end().max(position);
    let mut wanted_end = position + input.buffer_goal;
    if let Some(max_ahead) = input.max_buffer_ahead {
        wanted_end = wanted_end.min(position + max_ahead);
    }
    if let Some(period_end) = period.end {
        wanted_end = wanted_end.min(period_end);
    }

    let mut needed_segments = Vec::new();
    let mut is_buffer_full = false;
    if wanted_end > wanted_start + ROUNDING_ERROR {
        let mut total_size = input.inventory.buffered_bytes();
        for segment in index.get_segments(wanted_start, wanted_end - wanted_start) {
            if input.skipped.contains(&segment.key()) || input.is_buffered(&segment) {
                continue;
            }
            let size = input.estimated_size(&segment);
            if let Some(max_size) = input.max_buffer_size {
                if total_size + size > max_size {
                    is_buffer_full = true;
                    break;
                }
            }
            total_size += size;
            needed_segments.push(segment);
        }
    }

    let imminent_discontinuity = match index.first_available_position() {
        AvailableBound::At(first) if position < first - ROUNDING_ERROR => Some(Discontinuity {
            start: position,
            end: first,
        }),
        _ if wanted_start < wanted_end => index
            .check_discontinuity(wanted_start)
            .filter(|end| *end > wanted_start + ROUNDING_ERROR)
            .map(|end| Discontinuity {
                start: wanted_start,
                end,
            }),
        _ => None,
    };

    let content_end = match (period.end, index.last_available_position()) {
        (Some(period_end), AvailableBound::At(last)) => Some(period_end.min(last)),
        (Some(period_end), _) => Some(period_end),
        (None, AvailableBound::At(last)) if index.is_finished() => Some(last),
        _ => None,
    };
    let has_finished_loading = match content_end {
        Some(end) => {
            needed_segments.is_empty()
                && !is_buffer_full
                && index.is_finished()
                && wanted_end >= end - ROUNDING_ERROR
                && index.await_segment_between(wanted_start, end) != Some(true)
        }
        None => false,
    };

    BufferStatus {
        imminent_discontinuity,
        has_finished_loading,
        needed_segments,
        should_refresh_manifest: index.should_refresh(wanted_start, wanted_end),
        is_buffer_full,
    }
}
