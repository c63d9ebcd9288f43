//! Scheduling of segment loads, per media type.
//!
//! ```text
//! Orchestrator
//!  ├── AdaptationStream (video) ── RepresentationStream ── SegmentSink
//!  ├── AdaptationStream (audio) ── RepresentationStream ── SegmentSink
//!  └── AdaptationStream (text)  ── RepresentationStream ── SegmentSink
//! ```
use std::time::Duration;

use crate::{
    buffer::{BufferedRanges, Discontinuity},
    error::SazanamiError,
    fetch::FetchProgress,
    index::Segment,
};

pub mod adaptation;
pub mod orchestrator;
pub mod representation;
pub mod switch;

pub use adaptation::{AdaptationCommand, AdaptationStream, AdaptationStreamArgs, TrackPreference};
pub use orchestrator::{Orchestrator, OrchestratorCommand, OrchestratorEvent};
pub use representation::{
    RepresentationStream, RepresentationStreamArgs, SchedulerState, StreamEnd, StreamOutcome, TerminationRequest,
};
pub use switch::{get_switch_action, CodecSupportCache, CodecSupportProbe, SwitchAction};

/// Signals emitted by a [RepresentationStream].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    StateChanged(SchedulerState),
    RequestBegin {
        id: u64,
        segment: Segment,
    },
    RequestProgress {
        id: u64,
        progress: FetchProgress,
    },
    RequestEnd {
        id: u64,
    },
    /// A segment request completed, sample for the bandwidth estimator.
    Metrics {
        id: u64,
        size: u64,
        duration: Duration,
        segment_duration: f64,
    },
    AddedSegment {
        segment: Segment,
        buffered: BufferedRanges,
    },
    /// Playback has to jump over a hole.
    Discontinuity(Discontinuity),
    NeedsManifestRefresh,
    /// Every segment of the period was pushed.
    StreamComplete {
        period_id: String,
    },
    /// A recoverable failure.
    Warning(SazanamiError),
    Retry {
        segment: Segment,
        attempt: u32,
        delay: Duration,
        error: SazanamiError,
    },
}
