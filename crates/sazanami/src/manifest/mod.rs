//! In-memory model of a presentation.
//!
//! A [Manifest] is immutable once published: refreshes build a new value,
//! merge it with the current one and publish it through a [ManifestUpdater].
//! Readers hold a [ManifestHandle] and re-borrow the latest snapshot when
//! they need it instead of keeping sub-objects around.
use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};
use url::Url;

use crate::index::{BufferDepthCalculator, SegmentIndex, ROUNDING_ERROR};

pub mod base_url;
pub mod clock;
pub mod dash;
pub mod loader;

pub use clock::Clock;
pub use loader::ManifestLoader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Text,
}

impl MediaType {
    pub const ALL: [MediaType; 3] = [MediaType::Video, MediaType::Audio, MediaType::Text];

    /// Top-level type of a `contentType` attribute or of a MIME type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let top_level = content_type.split('/').next().unwrap_or(content_type);
        match top_level {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "text" => Some(Self::Text),
            "application" if content_type.contains("ttml") || content_type.contains("mp4") => {
                Some(Self::Text)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
        })
    }
}

/// One concrete encoding of a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bitrate: u64,
    pub codec: Option<String>,
    pub mime_type: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub index: SegmentIndex,
}

impl Representation {
    /// `mimeType;codecs="..."` string as understood by media sinks.
    pub fn codec_string(&self) -> String {
        match (&self.mime_type, &self.codec) {
            (Some(mime), Some(codec)) => format!("{mime};codecs=\"{codec}\""),
            (Some(mime), None) => mime.clone(),
            (None, Some(codec)) => format!("codecs=\"{codec}\""),
            (None, None) => String::new(),
        }
    }
}

/// Interchangeable representations of one track.
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    pub id: String,
    pub media_type: MediaType,
    pub language: Option<String>,
    pub is_audio_description: bool,
    pub is_closed_caption: bool,
    /// Sorted by ascending bitrate.
    pub representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    pub fn representation(&self, id: &str) -> Option<&Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id)
    }
}

/// A time span of the presentation with its own set of tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: String,
    pub start: f64,
    /// `None` while the period is still open.
    pub end: Option<f64>,
    pub adaptations: HashMap<MediaType, Vec<Arc<Adaptation>>>,
}

impl Period {
    pub fn contains(&self, position: f64) -> bool {
        position >= self.start - ROUNDING_ERROR
            && self.end.map_or(true, |end| position < end - ROUNDING_ERROR)
    }

    pub fn adaptations_of(&self, media_type: MediaType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&media_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn adaptation(&self, media_type: MediaType, id: &str) -> Option<&Arc<Adaptation>> {
        self.adaptations_of(media_type).iter().find(|a| a.id == id)
    }

    /// Merge `new` into `self`. The end of a period never moves backwards.
    fn merge_update(&mut self, mut new: Period) {
        new.end = match (self.end, new.end) {
            (Some(old), Some(end)) if end < old => {
                tracing::warn!(period = %self.id, old, end, "Ignoring period end moving backwards");
                Some(old)
            }
            (Some(old), None) => Some(old),
            (_, end) => end,
        };

        for (media_type, adaptations) in new.adaptations.iter_mut() {
            for adaptation in adaptations.iter_mut() {
                let Some(old_adaptation) = self.adaptation(*media_type, &adaptation.id) else {
                    continue;
                };
                let adaptation = Arc::make_mut(adaptation);
                for representation in adaptation.representations.iter_mut() {
                    if let Some(old) = old_adaptation.representation(&representation.id) {
                        let mut index = old.index.clone();
                        index.update(representation.index.clone());
                        Arc::make_mut(representation).index = index;
                    }
                }
            }
        }

        *self = new;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub url: Option<Url>,
    pub is_dynamic: bool,
    /// Zero point of the presentation timeline, seconds since the UNIX epoch.
    pub availability_start_time: f64,
    pub time_shift_buffer_depth: Option<f64>,
    /// Seconds the local clock is behind the server clock.
    pub clock_offset: f64,
    pub suggested_presentation_delay: Option<f64>,
    pub minimum_update_period: Option<f64>,
    pub periods: Vec<Arc<Period>>,
    /// Live timing shared with the segment indexes.
    pub live: Option<BufferDepthCalculator>,
}

impl Manifest {
    pub fn period_for(&self, position: f64) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.contains(position))
    }

    pub fn period(&self, id: &str) -> Option<&Arc<Period>> {
        self.periods.iter().find(|p| p.id == id)
    }

    pub fn next_period(&self, period: &Period) -> Option<&Arc<Period>> {
        self.periods
            .iter()
            .find(|p| p.start >= period.start + ROUNDING_ERROR && p.id != period.id)
    }

    pub fn is_last_period(&self, period: &Period) -> bool {
        self.next_period(period).is_none()
    }

    /// Current live position on the presentation timeline.
    pub fn live_position(&self) -> Option<f64> {
        self.live.map(|live| live.live_position())
    }

    /// Position to start a live presentation at.
    pub fn live_start_position(&self) -> Option<f64> {
        let live_position = self.live_position()?;
        let delay = self.suggested_presentation_delay.unwrap_or(10.);
        let minimum = self
            .live
            .and_then(|live| live.first_available_position())
            .unwrap_or(0.);
        Some((live_position - delay).max(minimum))
    }

    /// Anchor the live position from the clock-corrected wall clock time.
    pub fn set_wall_clock(&mut self, unix_now: f64) {
        if !self.is_dynamic {
            return;
        }
        let mut live = self
            .live
            .unwrap_or_else(|| BufferDepthCalculator::new(self.time_shift_buffer_depth));
        live.set_live_position(unix_now - self.availability_start_time, Instant::now());
        self.live = Some(live);
        self.propagate_live();
    }

    fn propagate_live(&mut self) {
        let live = self.live;
        for period in self.periods.iter_mut() {
            let period = Arc::make_mut(period);
            for adaptations in period.adaptations.values_mut() {
                for adaptation in adaptations.iter_mut() {
                    let adaptation = Arc::make_mut(adaptation);
                    for representation in adaptation.representations.iter_mut() {
                        Arc::make_mut(representation).index.set_live(live);
                    }
                }
            }
        }
    }

    /// Merge a freshly loaded manifest into this one.
    pub fn merge_update(&mut self, new: Manifest) {
        let Manifest {
            url,
            is_dynamic,
            availability_start_time,
            time_shift_buffer_depth,
            clock_offset,
            suggested_presentation_delay,
            minimum_update_period,
            periods,
            live,
        } = new;

        let mut merged = Vec::with_capacity(periods.len());
        for period in periods {
            match self.period(&period.id) {
                Some(old) => {
                    let mut old = Period::clone(old);
                    old.merge_update(Period::clone(&period));
                    merged.push(Arc::new(old));
                }
                None => merged.push(period),
            }
        }

        // periods gone from the update but still inside the window are kept
        let first_new_start = merged.first().map(|p| p.start);
        let window_start = live.and_then(|l| l.first_available_position());
        let mut kept: Vec<_> = self
            .periods
            .iter()
            .filter(|old| merged.iter().all(|p| p.id != old.id))
            .filter(|old| first_new_start.map_or(false, |start| old.start < start))
            .filter(|old| match (old.end, window_start) {
                (Some(end), Some(window_start)) => end > window_start,
                _ => true,
            })
            .cloned()
            .collect();
        kept.extend(merged);

        self.url = url.or_else(|| self.url.take());
        self.is_dynamic = is_dynamic;
        self.availability_start_time = availability_start_time;
        self.time_shift_buffer_depth = time_shift_buffer_depth;
        self.clock_offset = clock_offset;
        self.suggested_presentation_delay = suggested_presentation_delay;
        self.minimum_update_period = minimum_update_period;
        self.periods = kept;
        self.live = live;
        self.propagate_live();
    }
}

pub type ManifestHandle = watch::Receiver<Arc<Manifest>>;

/// Single writer of the current manifest.
pub struct ManifestUpdater {
    sender: watch::Sender<Arc<Manifest>>,
}

impl ManifestUpdater {
    pub fn new(manifest: Manifest) -> (Self, ManifestHandle) {
        let (sender, receiver) = watch::channel(Arc::new(manifest));
        (Self { sender }, receiver)
    }

    pub fn current(&self) -> Arc<Manifest> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> ManifestHandle {
        self.sender.subscribe()
    }

    /// Merge `new` into the current manifest and publish the result.
    pub fn update(&self, new: Manifest) {
        let mut manifest = Manifest::clone(&self.current());
        manifest.merge_update(new);
        tracing::debug!(periods = manifest.periods.len(), "Manifest updated");
        self.sender.send_replace(Arc::new(manifest));
    }

    /// Publish `new` as is, dropping everything known before.
    pub fn replace(&self, new: Manifest) {
        self.sender.send_replace(Arc::new(new));
    }
}
