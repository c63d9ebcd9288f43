use url::Url;

use super::{AvailableBound, IndexContext, Segment};

/// Indexed addressing: one file covers the whole period.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticIndex {
    pub(crate) context: IndexContext,
    url: Option<Url>,
}

impl StaticIndex {
    pub fn new(context: IndexContext, url: Option<Url>) -> Self {
        Self { context, url }
    }

    pub(crate) fn segments(&self) -> Vec<Segment> {
        let Some(end) = self.context.period_end else {
            return Vec::new();
        };
        let timescale = self.context.timescale;
        let duration = ((end - self.context.period_start) * timescale as f64).round() as u64;

        vec![Segment {
            representation_id: self.context.representation_id.clone(),
            time: self.context.presentation_time_offset,
            duration,
            timescale,
            timestamp_offset: self.context.timestamp_offset(),
            number: None,
            is_init: false,
            complete: true,
            url: self.url.clone(),
            byte_range: None,
        }]
    }

    pub(crate) fn first_available_position(&self) -> AvailableBound {
        match self.context.period_end {
            Some(_) => AvailableBound::At(self.context.period_start),
            None => AvailableBound::Unknown,
        }
    }

    pub(crate) fn last_available_position(&self) -> AvailableBound {
        self.context
            .period_end
            .map_or(AvailableBound::Unknown, AvailableBound::At)
    }
}
