use std::sync::Arc;

use tokio::time::Instant;

use super::{bandwidth::BandwidthEstimator, pending::PendingRequestsStore};
use crate::{config::AbrConfig, manifest::Representation};

/// Share of the segment duration a request may take before it is considered stalled.
const STALLED_REQUEST_RATIO: f64 = 1.2;

/// Hard limits on the representations the estimator may choose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub min_bitrate: Option<u64>,
    pub max_bitrate: Option<u64>,
    /// Representations wider than this are ignored.
    pub screen_width: Option<u64>,
}

impl Constraints {
    pub fn from_config(config: &AbrConfig) -> Self {
        Self {
            min_bitrate: config.min_bitrate,
            max_bitrate: config.max_bitrate,
            screen_width: config.limit_to_screen_width,
        }
    }

    fn allows(&self, representation: &Representation) -> bool {
        let bitrate = representation.bitrate;
        self.min_bitrate.map_or(true, |min| bitrate >= min)
            && self.max_bitrate.map_or(true, |max| bitrate <= max)
            && match (self.screen_width, representation.width) {
                (Some(screen), Some(width)) => width <= screen,
                _ => true,
            }
    }

    /// Representations allowed, by ascending bitrate. Never empty when
    /// `representations` is not: the lowest one is kept when all are excluded.
    pub fn filter(&self, representations: &[Arc<Representation>]) -> Vec<Arc<Representation>> {
        let mut sorted = representations.to_vec();
        sorted.sort_by_key(|r| r.bitrate);

        let allowed: Vec<_> = sorted.iter().filter(|r| self.allows(r)).cloned().collect();
        if allowed.is_empty() {
            sorted.into_iter().take(1).collect()
        } else {
            allowed
        }
    }
}

/// Why a representation was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceReason {
    /// A bitrate was locked by the user.
    Manual,
    /// Not enough data was sampled yet.
    Initial,
    Bandwidth,
    /// The buffer is close to running dry.
    Starvation,
    /// An in-flight request is too slow to keep up.
    StalledRequest,
}

#[derive(Debug, Clone)]
pub struct RepresentationChoice {
    pub representation: Arc<Representation>,
    /// Bandwidth estimate the choice is based on, in bits per second.
    pub bandwidth: Option<f64>,
    /// The current representation should be abandoned without waiting for in-flight requests.
    pub urgent: bool,
    pub reason: ChoiceReason,
}

pub struct EstimatorInput<'a> {
    pub representations: &'a [Arc<Representation>],
    pub current: Option<&'a Representation>,
    /// Seconds of media buffered ahead of the position.
    pub buffer_gap: f64,
    pub speed: f64,
    pub pending: &'a PendingRequestsStore,
}

/// Chooses the representation to load, one instance per media type.
pub struct RepresentationEstimator {
    config: AbrConfig,
    bandwidth: BandwidthEstimator,
    constraints: Constraints,
    manual_bitrate: Option<u64>,
    in_starvation: bool,
}

impl RepresentationEstimator {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            config: config.clone(),
            bandwidth: BandwidthEstimator::new(config),
            constraints: Constraints::from_config(config),
            manual_bitrate: config.manual_bitrate,
            in_starvation: false,
        }
    }

    pub fn add_sample(&mut self, duration_ms: f64, bytes: u64) {
        self.bandwidth.add_sample(duration_ms, bytes);
    }

    pub fn bandwidth(&self) -> Option<f64> {
        self.bandwidth.estimate()
    }

    pub fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    pub fn lock_bitrate(&mut self, bitrate: Option<u64>) {
        self.manual_bitrate = bitrate;
    }

    pub fn is_in_starvation(&self) -> bool {
        self.in_starvation
    }

    fn update_starvation(&mut self, buffer_gap: f64) {
        if !self.in_starvation && buffer_gap <= self.config.starvation_gap {
            tracing::debug!(buffer_gap, "Entering starvation mode");
            self.in_starvation = true;
        } else if self.in_starvation && buffer_gap >= self.config.out_of_starvation_gap {
            tracing::debug!(buffer_gap, "Leaving starvation mode");
            self.in_starvation = false;
        }
    }

    /// Lowest throughput of the requests which take longer than they should.
    fn stalled_bandwidth(&self, pending: &PendingRequestsStore, buffer_gap: f64) -> Option<f64> {
        let now = Instant::now();
        pending
            .requests()
            .iter()
            .filter(|request| !request.content.segment.is_init)
            .filter(|request| {
                let elapsed = now
                    .saturating_duration_since(request.request_timestamp)
                    .as_secs_f64();
                let segment_duration = request.content.segment.duration_secs();
                elapsed > segment_duration * STALLED_REQUEST_RATIO
                    || (self.in_starvation && elapsed > buffer_gap.max(1.))
            })
            .filter_map(|request| request.observed_bandwidth(now))
            .min_by(|a, b| a.total_cmp(b))
    }

    fn safety_factor(&self, buffer_gap: f64) -> f64 {
        if self.in_starvation {
            return self.config.starvation_factor;
        }
        let base = self.config.regular_factor;
        let (low, high) = (self.config.buffer_bonus_low, self.config.buffer_bonus_high);
        if high <= low {
            return base;
        }
        let bonus = ((buffer_gap - low) / (high - low)).clamp(0., 1.);
        base + (1. - base) * bonus
    }

    pub fn estimate(&mut self, input: &EstimatorInput<'_>) -> Option<RepresentationChoice> {
        let candidates = self.constraints.filter(input.representations);
        let lowest = candidates.first()?.clone();
        self.update_starvation(input.buffer_gap);

        let pick = |limit: f64| -> Arc<Representation> {
            let chosen = candidates
                .iter()
                .rev()
                .find(|r| r.bitrate as f64 <= limit)
                .unwrap_or(&lowest);
            // ties go to the representation already playing
            input
                .current
                .and_then(|current| {
                    candidates
                        .iter()
                        .find(|r| r.id == current.id && r.bitrate == chosen.bitrate)
                })
                .unwrap_or(chosen)
                .clone()
        };
        let current_bitrate = input.current.map(|c| c.bitrate);

        if let Some(manual) = self.manual_bitrate {
            let representation = pick(manual as f64);
            return Some(RepresentationChoice {
                urgent: current_bitrate.map_or(false, |b| b != representation.bitrate),
                representation,
                bandwidth: self.bandwidth(),
                reason: ChoiceReason::Manual,
            });
        }

        let measured = self.bandwidth.estimate();
        let stalled = self.stalled_bandwidth(input.pending, input.buffer_gap);
        let (bandwidth, reason) = match (measured, stalled) {
            (Some(m), Some(s)) if s < m => (s, ChoiceReason::StalledRequest),
            (None, Some(s)) => (s, ChoiceReason::StalledRequest),
            (Some(m), _) if self.in_starvation => (m, ChoiceReason::Starvation),
            (Some(m), _) => (m, ChoiceReason::Bandwidth),
            (None, None) => {
                return Some(RepresentationChoice {
                    representation: pick(self.config.initial_bitrate as f64),
                    bandwidth: None,
                    urgent: false,
                    reason: ChoiceReason::Initial,
                });
            }
        };

        let speed = if input.speed > 0. { input.speed } else { 1. };
        let limit = bandwidth * self.safety_factor(input.buffer_gap) / speed;
        let representation = pick(limit);

        let is_downgrade = current_bitrate.map_or(false, |b| representation.bitrate < b);
        let urgent = is_downgrade
            && matches!(reason, ChoiceReason::StalledRequest | ChoiceReason::Starvation);
        if urgent {
            tracing::info!(
                bandwidth,
                representation_id = %representation.id,
                ?reason,
                "Urgent switch to a lower representation"
            );
        }

        Some(RepresentationChoice {
            representation,
            bandwidth: Some(bandwidth),
            urgent,
            reason,
        })
    }
}
