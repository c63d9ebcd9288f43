use url::Url;

use crate::util::range::ByteRange;

/// Descriptor of one addressable chunk of a representation. Carries no media bytes.
///
/// `time` and `duration` are expressed in `timescale` units on the sample
/// timeline. The presentation time of the segment is
/// `time / timescale + timestamp_offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub representation_id: String,
    pub time: u64,
    pub duration: u64,
    pub timescale: u64,
    /// Seconds to add to the sample timeline to reach the presentation timeline.
    pub timestamp_offset: f64,
    pub number: Option<u64>,
    pub is_init: bool,
    /// `false` while the end of the segment is not known yet.
    pub complete: bool,
    pub url: Option<Url>,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    pub fn start(&self) -> f64 {
        self.time as f64 / self.timescale as f64 + self.timestamp_offset
    }

    pub fn end(&self) -> f64 {
        (self.time + self.duration) as f64 / self.timescale as f64 + self.timestamp_offset
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / self.timescale as f64
    }

    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            representation_id: self.representation_id.clone(),
            time: self.time,
            is_init: self.is_init,
        }
    }

    /// Short name used in logs.
    pub fn file_name(&self) -> String {
        self.url
            .as_ref()
            .and_then(|u| u.path_segments().and_then(|mut s| s.next_back()))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match (self.is_init, self.number) {
                (true, _) => format!("{}_init", self.representation_id),
                (false, Some(number)) => format!("{}_{number}", self.representation_id),
                (false, None) => format!("{}_{}", self.representation_id, self.time),
            })
    }
}

/// Identity of a segment, independent of the descriptor instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub representation_id: String,
    pub time: u64,
    pub is_init: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presentation_time() {
        let segment = Segment {
            representation_id: "v1".to_string(),
            time: 90_000,
            duration: 180_000,
            timescale: 90_000,
            timestamp_offset: 10.,
            number: Some(2),
            is_init: false,
            complete: true,
            url: Url::parse("https://example.com/v1/2.m4s").ok(),
            byte_range: None,
        };

        assert_eq!(segment.start(), 11.);
        assert_eq!(segment.end(), 13.);
        assert_eq!(segment.duration_secs(), 2.);
        assert_eq!(segment.file_name(), "2.m4s");
        assert_eq!(
            segment.key(),
            SegmentKey {
                representation_id: "v1".to_string(),
                time: 90_000,
                is_init: false,
            }
        );
    }
}
