use url::Url;

use super::{
    url_template::TemplateArgs, AvailableBound, IndexContext, Segment, ROUNDING_ERROR,
};
use crate::util::range::ByteRange;

/// One `S` element of a `SegmentTimeline`, or one `SegmentURL` of a `SegmentList`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Start on the sample timeline, in timescale units.
    pub start: u64,
    pub duration: u64,
    /// Additional segments of the same duration. A negative value repeats
    /// until the next entry, the period end or the live edge.
    pub repeat: i64,
    /// Explicit media location, used instead of the media template.
    pub url: Option<Url>,
    pub byte_range: Option<ByteRange>,
}

impl TimelineEntry {
    pub fn new(start: u64, duration: u64, repeat: i64) -> Self {
        Self {
            start,
            duration,
            repeat,
            url: None,
            byte_range: None,
        }
    }
}

/// Explicit addressing: every segment is listed in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineIndex {
    pub(crate) context: IndexContext,
    entries: Vec<TimelineEntry>,
    /// Number of the first segment of `entries`.
    start_number: Option<u64>,
    /// Absolute media URL template, `None` when entries carry their own URL.
    media: Option<String>,
    /// Segments announced before the manifest lists them.
    predicted: Vec<Segment>,
}

impl TimelineIndex {
    pub fn new(
        context: IndexContext,
        entries: Vec<TimelineEntry>,
        start_number: Option<u64>,
        media: Option<String>,
    ) -> Self {
        Self {
            context,
            entries,
            start_number,
            media,
            predicted: Vec::new(),
        }
    }

    fn repeat_count(&self, i: usize) -> u64 {
        let entry = &self.entries[i];
        if entry.repeat >= 0 || entry.duration == 0 {
            return entry.repeat.max(0) as u64 + 1;
        }

        let limit = self
            .entries
            .get(i + 1)
            .map(|next| next.start as f64)
            .or_else(|| self.context.period_end.map(|e| self.context.to_media_time(e)))
            .or_else(|| {
                self.context
                    .live_edge()
                    .map(|e| self.context.to_media_time(e))
            });
        match limit {
            Some(limit) if limit > entry.start as f64 => {
                ((limit - entry.start as f64) / entry.duration as f64).ceil() as u64
            }
            _ => 1,
        }
    }

    fn make_segment(&self, entry: &TimelineEntry, time: u64, number: Option<u64>) -> Segment {
        let url = match (&entry.url, &self.media) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(media)) => {
                let args = TemplateArgs::new(&self.context.representation_id, self.context.bandwidth)
                    .with_segment(number, time);
                let resolved = args.resolve(media);
                match Url::parse(&resolved) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!(url = %resolved, error = %e, "Invalid segment url");
                        None
                    }
                }
            }
            (None, None) => None,
        };

        Segment {
            representation_id: self.context.representation_id.clone(),
            time,
            duration: entry.duration,
            timescale: self.context.timescale,
            timestamp_offset: self.context.timestamp_offset(),
            number,
            is_init: false,
            complete: true,
            url,
            byte_range: entry.byte_range,
        }
    }

    /// Every segment listed by the manifest, without availability filtering.
    fn listed_segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut number = self.start_number;
        let mut cursor = 0;

        'entries: for (i, entry) in self.entries.iter().enumerate() {
            for k in 0..self.repeat_count(i) {
                let time = entry.start + k * entry.duration;
                let current = number;
                number = number.map(|n| n + 1);

                // overlapping declarations, keep the earliest one
                if time < cursor {
                    continue;
                }
                if self
                    .context
                    .is_past_period_end(self.context.to_position(time))
                {
                    break 'entries;
                }

                cursor = time + entry.duration;
                segments.push(self.make_segment(entry, time, current));
            }
        }
        segments
    }

    /// Listed segments followed by predicted ones.
    fn known_segments(&self) -> Vec<Segment> {
        let mut segments = self.listed_segments();
        let mut cursor = segments.last().map(|s| s.time + s.duration).unwrap_or(0);
        for predicted in &self.predicted {
            if predicted.time >= cursor
                && !self
                    .context
                    .is_past_period_end(self.context.to_position(predicted.time))
            {
                cursor = predicted.time + predicted.duration;
                segments.push(predicted.clone());
            }
        }
        segments
    }

    pub(crate) fn available_segments(&self) -> Vec<Segment> {
        let edge = self.context.live_edge();
        let window_start = self.context.window_start();
        self.known_segments()
            .into_iter()
            .filter(|s| edge.map_or(true, |edge| s.end() <= edge + ROUNDING_ERROR))
            .filter(|s| window_start.map_or(true, |start| s.end() > start))
            .collect()
    }

    fn last_known_end(&self) -> Option<f64> {
        self.known_segments().last().map(Segment::end)
    }

    pub(crate) fn first_available_position(&self) -> AvailableBound {
        match self.available_segments().first() {
            Some(segment) => AvailableBound::At(segment.start()),
            None if self.context.is_dynamic && self.entries.is_empty() => AvailableBound::Unknown,
            None => AvailableBound::NoSegment,
        }
    }

    pub(crate) fn last_available_position(&self) -> AvailableBound {
        match self.available_segments().last() {
            Some(segment) => AvailableBound::At(segment.end()),
            None if self.context.is_dynamic && self.entries.is_empty() => AvailableBound::Unknown,
            None => AvailableBound::NoSegment,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        if !self.context.is_dynamic {
            return true;
        }
        match (self.context.period_end, self.last_known_end()) {
            (Some(period_end), Some(last)) => last >= period_end - ROUNDING_ERROR,
            _ => false,
        }
    }

    pub(crate) fn await_segment_between(&self, start: f64, end: f64) -> Option<bool> {
        if !self.context.is_dynamic || self.context.is_past_period_end(start) {
            return Some(false);
        }

        let available = self.available_segments();
        if matches!(available.last(), Some(last) if end <= last.end() + ROUNDING_ERROR) {
            return Some(false);
        }
        if self.is_finished() {
            // nothing new can be listed, only wait for listed segments not yet available
            let listed_after = self
                .known_segments()
                .iter()
                .any(|s| s.end() > start && s.start() < end && !available.contains(s));
            return Some(listed_after);
        }
        if self.entries.is_empty() && self.context.live.is_none() {
            return None;
        }
        Some(true)
    }

    pub(crate) fn should_refresh(&self, _start: f64, end: f64) -> bool {
        if !self.context.is_dynamic || self.is_finished() {
            return false;
        }
        let (Some(last_end), Some(edge)) = (self.last_known_end(), self.context.live_edge()) else {
            return false;
        };
        end > last_end && edge > last_end + ROUNDING_ERROR
    }

    pub(crate) fn check_discontinuity(&self, time: f64) -> Option<f64> {
        for segment in self.available_segments() {
            if time < segment.start() - ROUNDING_ERROR {
                return Some(segment.start());
            }
            if time < segment.end() {
                return None;
            }
        }
        None
    }

    pub(crate) fn is_segment_still_available(&self, segment: &Segment) -> bool {
        if segment.representation_id != self.context.representation_id {
            return false;
        }
        let window_start = self.context.window_start();
        self.known_segments().iter().any(|known| {
            known.time == segment.time
                && known.duration == segment.duration
                && window_start.map_or(true, |start| known.end() > start)
        })
    }

    pub(crate) fn update(&mut self, new: TimelineIndex) {
        let Some(new_first) = new.entries.first().map(|e| e.start) else {
            self.context = new.context;
            return;
        };

        let mut kept = Vec::new();
        let mut kept_count = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.start >= new_first || entry.duration == 0 {
                break;
            }
            let fit = ((new_first - entry.start) / entry.duration).min(self.repeat_count(i));
            if fit == 0 {
                break;
            }
            kept.push(TimelineEntry {
                repeat: fit as i64 - 1,
                ..entry.clone()
            });
            kept_count += fit;
        }

        let mut merged = TimelineIndex {
            context: new.context,
            start_number: new.start_number.map(|n| n.saturating_sub(kept_count)),
            entries: kept.into_iter().chain(new.entries).collect(),
            media: new.media.or_else(|| self.media.take()),
            predicted: Vec::new(),
        };

        let listed_end = merged
            .listed_segments()
            .last()
            .map(|s| s.time + s.duration)
            .unwrap_or(0);
        merged.predicted = self
            .predicted
            .drain(..)
            .chain(new.predicted)
            .filter(|p| p.time >= listed_end)
            .collect();

        merged.prune();
        *self = merged;
    }

    /// Drop entries that left the timeshift window.
    fn prune(&mut self) {
        let Some(window_start) = self.context.window_start() else {
            return;
        };
        while self.entries.len() > 1 {
            let count = self.repeat_count(0);
            let first = &self.entries[0];
            let end = self
                .context
                .to_position(first.start + count * first.duration);
            if end > window_start {
                break;
            }
            self.entries.remove(0);
            self.start_number = self.start_number.map(|n| n + count);
        }
    }

    pub(crate) fn add_predicted_segments(&mut self, predicted: &[Segment], current: &Segment) {
        let mut cursor = self
            .known_segments()
            .last()
            .map(|s| s.time + s.duration)
            .unwrap_or(current.time + current.duration);
        for segment in predicted {
            if segment.representation_id != self.context.representation_id || segment.is_init {
                continue;
            }
            if segment.time >= cursor {
                tracing::debug!(
                    representation_id = %segment.representation_id,
                    time = segment.time,
                    "Adding predicted segment"
                );
                cursor = segment.time + segment.duration;
                self.predicted.push(segment.clone());
            }
        }
    }
}
