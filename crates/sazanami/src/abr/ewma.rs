/// Exponentially weighted moving average, weighted by sample duration.
///
/// The estimate is kept normalised by the accumulated weight, so that the
/// first sample is returned as is instead of being biased towards zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Ewma {
    alpha: f64,
    estimate: Option<f64>,
    total_weight: f64,
}

impl Ewma {
    /// `half_life` is expressed in the unit of the sample weights.
    pub fn new(half_life: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life.max(0.001)),
            estimate: None,
            total_weight: 0.,
        }
    }

    pub fn add_sample(&mut self, weight: f64, value: f64) {
        let weight = weight.max(0.);
        let Some(estimate) = self.estimate else {
            self.estimate = Some(value);
            self.total_weight = weight;
            return;
        };
        if weight == 0. {
            return;
        }

        let adj_alpha = self.alpha.powf(weight);
        let total_weight = self.total_weight + weight;
        // share of the new sample once normalised by the accumulated weight
        let share = (1. - adj_alpha) / (1. - self.alpha.powf(total_weight));
        self.estimate = Some(estimate + share * (value - estimate));
        self.total_weight = total_weight;
    }

    pub fn estimate(&self) -> Option<f64> {
        self.estimate
    }

    pub fn reset(&mut self) {
        self.estimate = None;
        self.total_weight = 0.;
    }
}
