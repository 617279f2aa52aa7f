//! Byte ranges and range unification
//!
//! Reservations and stored blocks of a CacheFile are kept as plain lists of
//! inclusive ranges. Before any claim decision the list is unified into a
//! minimal, sorted, disjoint covering set:
//!
//! ```text
//!   input:    [0,9] [20,29] [10,14] [25,40] [50,50]
//!   unified:  [0,14] [20,40] [50,50]
//! ```
//!
//! Ranges that overlap or touch (`a.stop + 1 == b.start`) merge.

use serde::Serialize;

/// Stop offset of a range whose final length is not yet known
pub const OPEN_END: i64 = i64::MAX;

/// Inclusive byte range `[start, stop]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockRange {
    /// First byte offset (inclusive)
    pub start: i64,
    /// Last byte offset (inclusive)
    pub stop: i64,
}

impl BlockRange {
    /// Create a new range.
    pub fn new(start: i64, stop: i64) -> Self {
        debug_assert!(stop >= start, "block range must hold at least one byte");
        Self { start, stop }
    }

    /// Range of `len` bytes starting at `start`
    pub fn with_len(start: i64, len: u64) -> Self {
        Self::new(start, start + len as i64 - 1)
    }

    /// Number of bytes in this range.
    #[inline]
    pub fn len(&self) -> u64 {
        (self.stop - self.start) as u64 + 1
    }

    /// Ranges always hold at least one byte.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if the stop offset is still open.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.stop == OPEN_END
    }

    /// Replace both bounds.
    pub fn update(&mut self, start: i64, stop: i64) {
        debug_assert!(stop >= start);
        self.start = start;
        self.stop = stop;
    }

    /// Check if this range contains an offset.
    #[inline]
    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.start && pos <= self.stop
    }

    /// Check if this range fully contains another.
    #[inline]
    pub fn contains_range(&self, other: &BlockRange) -> bool {
        self.start <= other.start && self.stop >= other.stop
    }

    /// Check if this range overlaps with another.
    #[inline]
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }

    /// Overlapping part of two ranges.
    pub fn intersect(&self, other: &BlockRange) -> Option<BlockRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(BlockRange::new(
            self.start.max(other.start),
            self.stop.min(other.stop),
        ))
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_open() {
            write!(f, "[{}, ..]", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.stop)
        }
    }
}

/// Merge overlapping and adjacent ranges into a sorted disjoint list.
pub fn unify(ranges: &[BlockRange]) -> Vec<BlockRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();

    let mut unified: Vec<BlockRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match unified.last_mut() {
            Some(last) if range.start <= last.stop.saturating_add(1) => {
                if range.stop > last.stop {
                    last.stop = range.stop;
                }
            }
            _ => unified.push(range),
        }
    }
    unified
}

/// Unified range containing `pos`, if any.
pub fn find_block_contains(unified: &[BlockRange], pos: i64) -> Option<BlockRange> {
    // unified is sorted and disjoint
    let idx = unified.partition_point(|r| r.stop < pos);
    unified.get(idx).copied().filter(|r| r.contains(pos))
}

/// Largest empty gap starting at `pos`.
///
/// Returns `[pos, min(next_start - 1, final_stop)]`, or `None` when `pos` is
/// already covered or lies past `final_stop`. An unknown final stop leaves the
/// gap open-ended when no reserved range follows.
pub fn find_empty_space(
    unified: &[BlockRange],
    pos: i64,
    final_stop: Option<i64>,
) -> Option<BlockRange> {
    if let Some(stop) = final_stop {
        if pos > stop {
            return None;
        }
    }
    if find_block_contains(unified, pos).is_some() {
        return None;
    }

    let limit = final_stop.unwrap_or(OPEN_END);
    let stop = unified
        .iter()
        .find(|r| r.start > pos)
        .map(|next| (next.start - 1).min(limit))
        .unwrap_or(limit);
    Some(BlockRange::new(pos, stop))
}

/// Parts of `range` not covered by `unified`.
pub fn subtract(range: BlockRange, unified: &[BlockRange]) -> Vec<BlockRange> {
    let mut gaps = Vec::new();
    let mut cursor = range.start;
    for covered in unified {
        if covered.stop < cursor {
            continue;
        }
        if covered.start > range.stop {
            break;
        }
        if covered.start > cursor {
            gaps.push(BlockRange::new(cursor, covered.start - 1));
        }
        cursor = covered.stop.saturating_add(1);
        if cursor > range.stop {
            return gaps;
        }
    }
    if cursor <= range.stop {
        gaps.push(BlockRange::new(cursor, range.stop));
    }
    gaps
}

// =============================================================================
// Tests
// =============================================================================
