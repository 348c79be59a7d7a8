use std::fmt;

use crate::error::{Result, VecfetchError};

/// Half-open byte interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(VecfetchError::InvalidRange { start: start as i128, end: end as i128 });
        }
        Ok(Self { start, end })
    }

    /// For callers that carry signed offsets; negative bounds are rejected.
    pub fn from_signed(start: i64, end: i64) -> Result<Self> {
        if start < 0 || end < start {
            return Err(VecfetchError::InvalidRange { start: start as i128, end: end as i128 });
        }
        Ok(Self { start: start as u64, end: end as u64 })
    }

    /// `[offset, offset + len)`, failing on overflow.
    pub fn at(offset: u64, len: u64) -> Result<Self> {
        let end = offset.checked_add(len).ok_or(VecfetchError::InvalidRange {
            start: offset as i128,
            end: offset as i128 + len as i128,
        })?;
        Ok(Self { start: offset, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// True when `other` lies entirely within `self`. An empty range is
    /// contained by any range whose bounds enclose its position.
    pub fn contains_range(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(ByteRange { start, end })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
