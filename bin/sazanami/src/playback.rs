use std::collections::HashMap;

use sazanami::{buffer::BufferedRanges, MediaType, PlaybackObservation, PlaybackObserver};

/// A fake player: the position moves forward only while every loaded media
/// type has data at the position.
pub struct SimulatedPlayback {
    observer: PlaybackObserver,
    buffered: HashMap<MediaType, BufferedRanges>,
    position: f64,
    speed: f64,
    rebuffering: bool,
}

impl SimulatedPlayback {
    pub fn new(observer: PlaybackObserver, position: f64, speed: f64) -> Self {
        Self {
            observer,
            buffered: HashMap::new(),
            position,
            speed,
            rebuffering: true,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn set_buffered(&mut self, media_type: MediaType, buffered: BufferedRanges) {
        self.buffered.insert(media_type, buffered);
    }

    pub fn clear_buffered(&mut self, media_type: MediaType) {
        self.buffered.remove(&media_type);
    }

    pub fn seek(&mut self, position: f64) {
        tracing::info!(from = self.position, to = position, "Seeking");
        self.position = position;
        self.publish();
    }

    /// Advance by `elapsed` seconds of wall clock time.
    pub fn tick(&mut self, elapsed: f64) {
        let playable_until = self.playable_until();
        let rebuffering = playable_until.map_or(true, |end| end <= self.position);
        if rebuffering != self.rebuffering {
            if rebuffering {
                tracing::warn!(position = self.position, "Rebuffering");
            } else {
                tracing::info!(position = self.position, "Playing");
            }
            self.rebuffering = rebuffering;
        }
        if let Some(end) = playable_until {
            self.position = (self.position + elapsed * self.speed).min(end).max(self.position);
        }
        self.publish();
    }

    /// End of the data buffered without a hole for every media type.
    fn playable_until(&self) -> Option<f64> {
        if self.buffered.is_empty() {
            return None;
        }
        self.buffered
            .values()
            .map(|ranges| ranges.contiguous_end_from(self.position))
            .try_fold(f64::MAX, |end, media_end| media_end.map(|e| end.min(e)))
    }

    fn publish(&self) {
        // the engine reads one set of ranges, give it the most constrained one
        let buffered = self
            .buffered
            .values()
            .min_by(|a, b| {
                let a = a.contiguous_end_from(self.position).unwrap_or(f64::MIN);
                let b = b.contiguous_end_from(self.position).unwrap_or(f64::MIN);
                a.total_cmp(&b)
            })
            .cloned()
            .unwrap_or_default();
        self.observer.observe(PlaybackObservation {
            position: self.position,
            buffered,
            speed: self.speed,
            rebuffering: self.rebuffering,
        });
    }
}
