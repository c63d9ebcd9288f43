use super::ewma::Ewma;
use crate::config::AbrConfig;

/// Network throughput estimate built from completed requests.
///
/// Two averages are kept: the fast one follows drops quickly, the slow one
/// absorbs noise. The lower of the two is reported.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    bytes_sampled: u64,
    minimum_chunk_size: u64,
    minimum_total_bytes: u64,
}

impl BandwidthEstimator {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast: Ewma::new(config.fast_half_life),
            slow: Ewma::new(config.slow_half_life),
            bytes_sampled: 0,
            minimum_chunk_size: config.minimum_chunk_size,
            minimum_total_bytes: config.minimum_total_bytes,
        }
    }

    /// Record a request which loaded `bytes` in `duration_ms` milliseconds.
    pub fn add_sample(&mut self, duration_ms: f64, bytes: u64) {
        if bytes < self.minimum_chunk_size || duration_ms <= 0. {
            return;
        }

        let bandwidth = bytes as f64 * 8000. / duration_ms;
        let weight = duration_ms / 1000.;
        self.fast.add_sample(weight, bandwidth);
        self.slow.add_sample(weight, bandwidth);
        self.bytes_sampled = self.bytes_sampled.saturating_add(bytes);
    }

    /// Estimated bandwidth in bits per second.
    pub fn estimate(&self) -> Option<f64> {
        if self.bytes_sampled < self.minimum_total_bytes {
            return None;
        }
        match (self.fast.estimate(), self.slow.estimate()) {
            (Some(fast), Some(slow)) => Some(fast.min(slow)),
            (fast, slow) => fast.or(slow),
        }
    }

    pub fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.bytes_sampled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_estimate_before_enough_bytes() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        estimator.add_sample(1000., 100_000);
        assert_eq!(estimator.estimate(), None);

        estimator.add_sample(1000., 100_000);
        assert_eq!(estimator.estimate(), Some(800_000.));
    }

    #[test]
    fn test_small_chunks_are_ignored() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        estimator.add_sample(1000., 200_000);
        for _ in 0..100 {
            estimator.add_sample(1., 1_000);
        }
        assert_eq!(estimator.estimate(), Some(1_600_000.));
    }

    #[test]
    fn test_drop_is_reported_quickly() {
        let mut estimator = BandwidthEstimator::new(&AbrConfig::default());
        for _ in 0..10 {
            estimator.add_sample(1000., 1_000_000);
        }
        estimator.add_sample(2000., 250_000);
        let estimate = estimator.estimate().unwrap();
        assert!(estimate < 8_000_000. * 0.8, "estimate {estimate}");

        estimator.reset();
        assert_eq!(estimator.estimate(), None);
    }
}
