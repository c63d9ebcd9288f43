//! Per-representation model of which segments exist and which are available.
//!
//! Three addressing schemes are supported, all behind the same contract:
//!
//! - [TimelineIndex]: an explicit list of segments (`SegmentTimeline` or `SegmentList`)
//! - [TemplateIndex]: segments of a nominal duration computed from their number
//! - [StaticIndex]: a single file covering the whole period
//!
//! Positions are seconds on the presentation timeline. For live content, the
//! zero point of the presentation timeline is the availability start time.
use url::Url;

use crate::util::range::ByteRange;

pub mod depth;
pub mod segment;
pub mod single;
pub mod template;
pub mod timeline;
pub mod url_template;

pub use depth::BufferDepthCalculator;
pub use segment::{Segment, SegmentKey};
pub use single::StaticIndex;
pub use template::TemplateIndex;
pub use timeline::{TimelineEntry, TimelineIndex};

/// Rounding tolerance, in seconds, used when comparing positions.
pub(crate) const ROUNDING_ERROR: f64 = 1e-3;

/// One bound of the retrievable media of an index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AvailableBound {
    At(f64),
    /// The index is known to contain no segment.
    NoSegment,
    /// The bound cannot be computed from what is known.
    Unknown,
}

impl AvailableBound {
    pub fn position(&self) -> Option<f64> {
        match self {
            Self::At(position) => Some(*position),
            _ => None,
        }
    }
}

/// Where the initialization segment of a representation lives.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegmentInfo {
    pub url: Option<Url>,
    pub byte_range: Option<ByteRange>,
}

/// Timing values shared by every addressing scheme of one representation.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexContext {
    pub representation_id: String,
    pub bandwidth: u64,
    pub period_start: f64,
    pub period_end: Option<f64>,
    pub timescale: u64,
    /// `@presentationTimeOffset`, in timescale units.
    pub presentation_time_offset: u64,
    /// Seconds a segment is available before its nominal availability time.
    pub availability_time_offset: f64,
    pub is_dynamic: bool,
    /// Live timing. Only used for dynamic presentations.
    pub live: Option<BufferDepthCalculator>,
    pub init: Option<InitSegmentInfo>,
}

impl IndexContext {
    pub fn new(representation_id: impl Into<String>, timescale: u64) -> Self {
        Self {
            representation_id: representation_id.into(),
            bandwidth: 0,
            period_start: 0.,
            period_end: None,
            timescale: timescale.max(1),
            presentation_time_offset: 0,
            availability_time_offset: 0.,
            is_dynamic: false,
            live: None,
            init: None,
        }
    }

    pub fn with_period(mut self, start: f64, end: Option<f64>) -> Self {
        self.period_start = start;
        self.period_end = end;
        self
    }

    pub fn with_live(mut self, live: BufferDepthCalculator) -> Self {
        self.is_dynamic = true;
        self.live = Some(live);
        self
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.period_start - self.presentation_time_offset as f64 / self.timescale as f64
    }

    /// Convert a presentation position into timescale units of the sample timeline.
    pub fn to_media_time(&self, position: f64) -> f64 {
        (position - self.timestamp_offset()) * self.timescale as f64
    }

    pub fn to_position(&self, media_time: u64) -> f64 {
        media_time as f64 / self.timescale as f64 + self.timestamp_offset()
    }

    /// Newest position whose media may already be requested.
    pub fn live_edge(&self) -> Option<f64> {
        if !self.is_dynamic {
            return None;
        }
        self.live
            .map(|live| live.live_position() + self.availability_time_offset)
    }

    /// Oldest position still inside the timeshift window.
    pub fn window_start(&self) -> Option<f64> {
        if !self.is_dynamic {
            return None;
        }
        self.live.and_then(|live| live.first_available_position())
    }

    pub fn init_segment(&self) -> Option<Segment> {
        let init = self.init.as_ref()?;
        Some(Segment {
            representation_id: self.representation_id.clone(),
            time: 0,
            duration: 0,
            timescale: self.timescale,
            timestamp_offset: self.timestamp_offset(),
            number: None,
            is_init: true,
            complete: true,
            url: init.url.clone(),
            byte_range: init.byte_range,
        })
    }

    fn is_past_period_end(&self, position: f64) -> bool {
        matches!(self.period_end, Some(end) if position >= end - ROUNDING_ERROR)
    }
}

/// Segment index of one representation, selected once from its addressing scheme.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentIndex {
    Timeline(TimelineIndex),
    Template(TemplateIndex),
    Static(StaticIndex),
}

impl SegmentIndex {
    pub fn context(&self) -> &IndexContext {
        match self {
            Self::Timeline(index) => &index.context,
            Self::Template(index) => &index.context,
            Self::Static(index) => &index.context,
        }
    }

    pub fn init_segment(&self) -> Option<Segment> {
        self.context().init_segment()
    }

    /// Segments needed to cover `[from, from + duration)`, in ascending order.
    ///
    /// Only segments currently available are returned.
    pub fn get_segments(&self, from: f64, duration: f64) -> Vec<Segment> {
        let to = from + duration;
        let segments = match self {
            Self::Timeline(index) => index.available_segments(),
            Self::Template(index) => return index.segments_between(from, to),
            Self::Static(index) => index.segments(),
        };
        segments
            .into_iter()
            .filter(|s| s.end() > from + ROUNDING_ERROR && s.start() < to - ROUNDING_ERROR)
            .collect()
    }

    pub fn first_available_position(&self) -> AvailableBound {
        match self {
            Self::Timeline(index) => index.first_available_position(),
            Self::Template(index) => index.first_available_position(),
            Self::Static(index) => index.first_available_position(),
        }
    }

    pub fn last_available_position(&self) -> AvailableBound {
        match self {
            Self::Timeline(index) => index.last_available_position(),
            Self::Template(index) => index.last_available_position(),
            Self::Static(index) => index.last_available_position(),
        }
    }

    /// `Some(true)` if a segment not known yet may still appear in `[start, end)`,
    /// `Some(false)` if every segment of the interval is already known,
    /// `None` if this cannot be told.
    pub fn await_segment_between(&self, start: f64, end: f64) -> Option<bool> {
        match self {
            Self::Timeline(index) => index.await_segment_between(start, end),
            Self::Template(index) => index.await_segment_between(start, end),
            Self::Static(_) => Some(false),
        }
    }

    /// Whether the manifest has to be fetched again to know the segments of `[start, end)`.
    pub fn should_refresh(&self, start: f64, end: f64) -> bool {
        match self {
            Self::Timeline(index) => index.should_refresh(start, end),
            Self::Template(_) | Self::Static(_) => false,
        }
    }

    /// If `time` is in a hole no segment can fill, the position where media resumes.
    pub fn check_discontinuity(&self, time: f64) -> Option<f64> {
        match self {
            Self::Timeline(index) => index.check_discontinuity(time),
            Self::Template(index) => index.check_discontinuity(time),
            Self::Static(_) => None,
        }
    }

    pub fn is_segment_still_available(&self, segment: &Segment) -> bool {
        if segment.is_init {
            return true;
        }
        match self {
            Self::Timeline(index) => index.is_segment_still_available(segment),
            Self::Template(index) => index.is_segment_still_available(segment),
            Self::Static(_) => true,
        }
    }

    /// No segment will ever be added to this index.
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Timeline(index) => index.is_finished(),
            Self::Template(index) => index.is_finished(),
            Self::Static(_) => true,
        }
    }

    /// Replace this index by one parsed from a fully reloaded manifest.
    pub fn replace(&mut self, new: SegmentIndex) {
        *self = new;
    }

    /// Merge an index parsed from a manifest update.
    ///
    /// Known segments older than the new index are kept while they are still
    /// available, predicted segments are kept until the new index reaches them.
    pub fn update(&mut self, new: SegmentIndex) {
        match (self, new) {
            (Self::Timeline(current), Self::Timeline(new)) => current.update(new),
            (current, new) => {
                if std::mem::discriminant(current) != std::mem::discriminant(&new) {
                    tracing::warn!(
                        representation_id = %new.context().representation_id,
                        "Addressing scheme changed on manifest update, replacing index"
                    );
                }
                current.replace(new)
            }
        }
    }

    /// Add segments announced ahead of time, e.g. by the media of `current`.
    pub fn add_predicted_segments(&mut self, predicted: &[Segment], current: &Segment) {
        if let Self::Timeline(index) = self {
            index.add_predicted_segments(predicted, current);
        }
    }

    /// Update the live anchor and period end after a manifest refresh.
    pub fn set_live(&mut self, live: Option<BufferDepthCalculator>) {
        let context = match self {
            Self::Timeline(index) => &mut index.context,
            Self::Template(index) => &mut index.context,
            Self::Static(index) => &mut index.context,
        };
        context.live = live;
    }
}
