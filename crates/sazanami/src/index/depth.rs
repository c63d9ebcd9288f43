use tokio::time::Instant;

/// Moving lower bound of the timeshift window of a live presentation.
///
/// The live position is only known at the instant it was measured, later
/// positions are extrapolated with the monotonic clock so that wall-clock
/// jumps on the device do not move the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferDepthCalculator {
    time_shift_buffer_depth: Option<f64>,
    live_position: f64,
    measured_at: Instant,
}

impl BufferDepthCalculator {
    pub fn new(time_shift_buffer_depth: Option<f64>) -> Self {
        Self {
            time_shift_buffer_depth,
            live_position: 0.,
            measured_at: Instant::now(),
        }
    }

    pub fn time_shift_buffer_depth(&self) -> Option<f64> {
        self.time_shift_buffer_depth
    }

    /// Anchor `position` (seconds on the presentation timeline) at `at`.
    pub fn set_live_position(&mut self, position: f64, at: Instant) {
        self.live_position = position;
        self.measured_at = at;
    }

    pub fn live_position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.measured_at).as_secs_f64();
        self.live_position + elapsed
    }

    pub fn live_position(&self) -> f64 {
        self.live_position_at(Instant::now())
    }

    /// `None` when the whole presentation is kept available.
    pub fn first_available_position_at(&self, now: Instant) -> Option<f64> {
        self.time_shift_buffer_depth
            .map(|depth| (self.live_position_at(now) - depth).max(0.))
    }

    pub fn first_available_position(&self) -> Option<f64> {
        self.first_available_position_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_moves_with_clock() {
        let mut calculator = BufferDepthCalculator::new(Some(30.));
        calculator.set_live_position(1000., Instant::now());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(calculator.live_position(), 1045.);
        assert_eq!(calculator.first_available_position(), Some(1015.));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_clamped_to_zero() {
        let mut calculator = BufferDepthCalculator::new(Some(120.));
        calculator.set_live_position(10., Instant::now());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calculator.first_available_position(), Some(0.));
    }

    #[test]
    fn test_without_depth() {
        let now = Instant::now();
        let mut calculator = BufferDepthCalculator::new(None);
        calculator.set_live_position(500., now);
        assert_eq!(calculator.first_available_position_at(now), None);
        assert_eq!(
            calculator.live_position_at(now + Duration::from_millis(1500)),
            501.5
        );
    }
}
