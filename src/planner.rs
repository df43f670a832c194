//! # Planner — Splitting the Total Range into Segments
//!
//! [`plan`] cuts an inclusive range of window starts into `count` segments.
//! Core ranges tile the total range exactly; the last core absorbs the
//! remainder of the integer division. Each segment's search range is its core
//! widened by `overlap` on both sides and clamped to the total range, so a
//! window straddling a core boundary is evaluated whole by at least one
//! searcher. Overlapping search ranges may report the same solution twice;
//! the orchestrator de-duplicates.

use anyhow::{bail, Result};
use rug::Integer;
use serde::Serialize;
use std::fmt;

/// Inclusive range of window starts, `low <= high`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub low: Integer,
    pub high: Integer,
}

impl Range {
    pub fn new(low: Integer, high: Integer) -> Result<Self> {
        if low > high {
            bail!("empty range: low {} exceeds high {}", low, high);
        }
        Ok(Range { low, high })
    }

    /// Number of window starts in the range.
    pub fn len(&self) -> Integer {
        Integer::from(&self.high - &self.low) + 1u32
    }

    pub fn contains(&self, n: &Integer) -> bool {
        *n >= self.low && *n <= self.high
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

impl Serialize for Range {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Range", 2)?;
        s.serialize_field("low", &self.low.to_string())?;
        s.serialize_field("high", &self.high.to_string())?;
        s.end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub id: u32,
    /// Starts owned exclusively by this segment.
    pub core: Range,
    /// Starts this segment's searcher actually evaluates.
    pub search: Range,
}

/// Partition `total` into `count` segments with `overlap` on each side.
pub fn plan(total: &Range, count: u32, overlap: u64) -> Result<Vec<Segment>> {
    if count == 0 {
        bail!("segment count must be at least 1");
    }
    let len = total.len();
    if len < count {
        bail!(
            "cannot split {} starts into {} segments",
            len,
            count
        );
    }
    let seg_len = Integer::from(&len / count);

    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let core_low = Integer::from(&total.low + Integer::from(&seg_len * i));
        let core_high = if i + 1 == count {
            total.high.clone()
        } else {
            Integer::from(&total.low + Integer::from(&seg_len * (i + 1))) - 1u32
        };

        let search_low = (Integer::from(&core_low - overlap)).max(total.low.clone());
        let search_high = (Integer::from(&core_high + overlap)).min(total.high.clone());

        segments.push(Segment {
            id: i,
            core: Range::new(core_low, core_high)?,
            search: Range::new(search_low, search_high)?,
        });
    }
    Ok(segments)
}
