use std::fmt;

use crate::error::{SazanamiError, SazanamiResult};

/// A contiguous range of bytes inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Inclusive end offset, when the range is bounded.
    pub fn last_byte(&self) -> Option<u64> {
        self.length
            .filter(|length| *length > 0)
            .map(|length| self.offset + length - 1)
    }

    pub fn to_http_range(&self) -> String {
        match self.last_byte() {
            Some(last) => format!("bytes={}-{}", self.offset, last),
            None => format!("bytes={}-", self.offset),
        }
    }

    /// Parse a `first-last` byte-range-spec as used by `@mediaRange`, `@range`
    /// and `@indexRange` (RFC 7233, subclause 2.1).
    pub fn parse<S>(s: S) -> SazanamiResult<Self>
    where
        S: AsRef<str>,
    {
        let s = s.as_ref().trim();
        let invalid = || SazanamiError::Manifest(format!("Invalid byte range: {s}"));

        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let first_byte_pos = start.parse::<u64>().map_err(|_| invalid())?;
        let last_byte_pos = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().map_err(|_| invalid())?)
        };
        if matches!(last_byte_pos, Some(last) if last < first_byte_pos) {
            return Err(invalid());
        }

        Ok(Self {
            offset: first_byte_pos,
            // 0-500 means 501 bytes
            length: last_byte_pos.map(|last_byte_pos| last_byte_pos - first_byte_pos + 1),
        })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_byte() {
            Some(last) => write!(f, "{}-{}", self.offset, last),
            None => write!(f, "{}-", self.offset),
        }
    }
}
