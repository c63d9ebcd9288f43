use url::Url;

use super::{url_template::TemplateArgs, AvailableBound, IndexContext, Segment, ROUNDING_ERROR};

/// Simple addressing: segments of a nominal `@duration`, numbered from `@startNumber`.
///
/// Nothing is listed, the available segments are computed from the period
/// bounds or, for live content, from the live edge and the timeshift window.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateIndex {
    pub(crate) context: IndexContext,
    /// Nominal segment duration, in timescale units.
    duration: u64,
    start_number: u64,
    /// Absolute media URL template.
    media: String,
}

impl TemplateIndex {
    pub fn new(context: IndexContext, duration: u64, start_number: u64, media: String) -> Self {
        Self {
            context,
            duration: duration.max(1),
            start_number,
            media,
        }
    }

    fn segment_duration_secs(&self) -> f64 {
        self.duration as f64 / self.context.timescale as f64
    }

    /// Fractional count of segments between the period start and `position`.
    fn segments_until(&self, position: f64) -> f64 {
        ((position - self.context.period_start) / self.segment_duration_secs()).max(0.)
    }

    fn position_of(&self, k: u64) -> f64 {
        self.context.period_start + k as f64 * self.segment_duration_secs()
    }

    /// Index of the first segment still inside the timeshift window.
    fn first_index(&self) -> u64 {
        match self.context.window_start() {
            Some(window_start) => self.segments_until(window_start).floor() as u64,
            None => 0,
        }
    }

    /// Number of segments available since the period start, `None` when unbounded.
    fn end_index(&self) -> Option<u64> {
        let by_period = self
            .context
            .period_end
            .map(|end| self.segments_until(end - ROUNDING_ERROR).ceil() as u64);
        if !self.context.is_dynamic {
            return by_period;
        }

        let by_edge = self
            .context
            .live_edge()
            .map(|edge| self.segments_until(edge + ROUNDING_ERROR).floor() as u64);
        match (by_period, by_edge) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn make_segment(&self, k: u64) -> Segment {
        let time = self.context.presentation_time_offset + k * self.duration;
        let number = self.start_number + k;
        let args = TemplateArgs::new(&self.context.representation_id, self.context.bandwidth)
            .with_segment(Some(number), time);
        let resolved = args.resolve(&self.media);
        let url = match Url::parse(&resolved) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(url = %resolved, error = %e, "Invalid segment url");
                None
            }
        };

        Segment {
            representation_id: self.context.representation_id.clone(),
            time,
            duration: self.duration,
            timescale: self.context.timescale,
            timestamp_offset: self.context.timestamp_offset(),
            number: Some(number),
            is_init: false,
            complete: true,
            url,
            byte_range: None,
        }
    }

    pub(crate) fn segments_between(&self, from: f64, to: f64) -> Vec<Segment> {
        let first = self
            .first_index()
            .max(self.segments_until(from + ROUNDING_ERROR).floor() as u64);
        let mut last = self.segments_until(to - ROUNDING_ERROR).ceil() as u64;
        if let Some(end) = self.end_index() {
            last = last.min(end);
        }
        (first..last).map(|k| self.make_segment(k)).collect()
    }

    pub(crate) fn first_available_position(&self) -> AvailableBound {
        let first = self.first_index();
        match self.end_index() {
            Some(end) if end <= first => AvailableBound::NoSegment,
            _ if self.context.is_dynamic && self.context.live.is_none() => AvailableBound::Unknown,
            _ => AvailableBound::At(self.position_of(first)),
        }
    }

    pub(crate) fn last_available_position(&self) -> AvailableBound {
        match self.end_index() {
            None => AvailableBound::Unknown,
            Some(end) if end <= self.first_index() => AvailableBound::NoSegment,
            Some(end) => {
                let position = self.position_of(end);
                AvailableBound::At(match self.context.period_end {
                    Some(period_end) => position.min(period_end),
                    None => position,
                })
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        if !self.context.is_dynamic {
            return true;
        }
        match (self.context.period_end, self.last_available_position()) {
            (Some(period_end), AvailableBound::At(last)) => last >= period_end - ROUNDING_ERROR,
            _ => false,
        }
    }

    pub(crate) fn await_segment_between(&self, start: f64, end: f64) -> Option<bool> {
        if !self.context.is_dynamic || self.context.is_past_period_end(start) {
            return Some(false);
        }
        if self.context.live.is_none() {
            return None;
        }
        match self.last_available_position() {
            AvailableBound::At(last) if end <= last + ROUNDING_ERROR => Some(false),
            _ => Some(true),
        }
    }

    pub(crate) fn check_discontinuity(&self, time: f64) -> Option<f64> {
        self.context.window_start()?;
        match self.first_available_position() {
            AvailableBound::At(first) if time < first - ROUNDING_ERROR => Some(first),
            _ => None,
        }
    }

    pub(crate) fn is_segment_still_available(&self, segment: &Segment) -> bool {
        if segment.representation_id != self.context.representation_id
            || segment.time < self.context.presentation_time_offset
        {
            return false;
        }
        let offset = segment.time - self.context.presentation_time_offset;
        if offset % self.duration != 0 {
            return false;
        }
        let k = offset / self.duration;
        k >= self.first_index() && self.end_index().map_or(true, |end| k < end)
    }
}
