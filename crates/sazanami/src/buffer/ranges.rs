use std::fmt;

use crate::index::ROUNDING_ERROR;

/// Gaps smaller than this between two buffered ranges are considered contiguous.
pub const MAX_GAP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start - ROUNDING_ERROR && position < self.end - ROUNDING_ERROR
    }

    pub fn is_empty(&self) -> bool {
        self.end - self.start <= ROUNDING_ERROR
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3})", self.start, self.end)
    }
}

/// Sorted, disjoint time ranges of buffered media.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedRanges {
    ranges: Vec<TimeRange>,
}

impl BufferedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut result = Self::new();
        for (start, end) in ranges {
            result.insert(start, end);
        }
        result
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Add `[start, end)`, merging it with every range it touches.
    pub fn insert(&mut self, start: f64, end: f64) {
        let mut new = TimeRange::new(start, end);
        if new.is_empty() {
            return;
        }

        let first = self
            .ranges
            .partition_point(|r| r.end < new.start - ROUNDING_ERROR);
        let last = self
            .ranges
            .partition_point(|r| r.start <= new.end + ROUNDING_ERROR);
        if first < last {
            new.start = new.start.min(self.ranges[first].start);
            new.end = new.end.max(self.ranges[last - 1].end);
        }
        self.ranges.splice(first..last, [new]);
    }

    /// Remove `[start, end)`, splitting the range which contains it if needed.
    pub fn remove(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end <= start || range.start >= end {
                kept.push(range);
                continue;
            }
            let before = TimeRange::new(range.start, start);
            let after = TimeRange::new(end, range.end);
            if !before.is_empty() {
                kept.push(before);
            }
            if !after.is_empty() {
                kept.push(after);
            }
        }
        self.ranges = kept;
    }

    pub fn range_containing(&self, position: f64) -> Option<TimeRange> {
        self.ranges.iter().find(|r| r.contains(position)).copied()
    }

    /// End of the media buffered without interruption from `position`,
    /// jumping over gaps smaller than [MAX_GAP].
    pub fn contiguous_end_from(&self, position: f64) -> Option<f64> {
        let mut end = self.range_containing(position)?.end;
        for range in self.ranges.iter() {
            if range.start < end - ROUNDING_ERROR {
                continue;
            }
            if range.start - end > MAX_GAP {
                break;
            }
            end = range.end;
        }
        Some(end)
    }

    /// Seconds buffered ahead of `position`, 0 if `position` is not buffered.
    pub fn gap_from(&self, position: f64) -> f64 {
        self.contiguous_end_from(position)
            .map_or(0., |end| (end - position).max(0.))
    }

    /// Ranges clipped to `[start, end)`.
    pub fn intersection(&self, start: f64, end: f64) -> Vec<TimeRange> {
        self.ranges
            .iter()
            .filter(|r| r.end > start && r.start < end)
            .map(|r| TimeRange::new(r.start.max(start), r.end.min(end)))
            .collect()
    }
}

impl fmt::Display for BufferedRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}
