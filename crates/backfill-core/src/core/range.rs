// crates/backfill-core/src/core/range.rs
// ============================================================================
// Module: Backfill Range Batcher
// Description: Inclusive key ranges, batch computation, and sub-batch slicing.
// Purpose: Turn a migration's key range into bounded, contiguous units of work.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A migration walks its key column from `min_value` to `max_value` in
//! contiguous batches. The progress cursor is the highest key already covered
//! by a succeeded job; the next batch starts right after it. Each batch is
//! sliced again into sub-batches so that a single write never touches more
//! than `sub_batch_size` keys, whatever the batch size is.
//!
//! All arithmetic is checked: a cursor at `i64::MAX` means the range is
//! exhausted, and batch ends saturate instead of wrapping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Key Ranges
// ============================================================================

/// Inclusive range over an ordered integer key column.
///
/// # Invariants
/// - `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// First key in the range (inclusive).
    start: i64,
    /// Last key in the range (inclusive).
    end: i64,
}

impl KeyRange {
    /// Creates a range, returning `None` when `start > end`.
    #[must_use]
    pub const fn new(start: i64, end: i64) -> Option<Self> {
        if start > end {
            return None;
        }
        Some(Self {
            start,
            end,
        })
    }

    /// Returns the first key (inclusive).
    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    /// Returns the last key (inclusive).
    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    /// Returns the number of keys covered, saturating at `u64::MAX`.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// Ranges are never empty; provided for API symmetry with `len`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true when `key` lies within the range.
    #[must_use]
    pub const fn contains(&self, key: i64) -> bool {
        key >= self.start && key <= self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ============================================================================
// SECTION: Range Batcher
// ============================================================================

/// Computes successive batches over a migration's key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeBatcher {
    /// Full range the migration must cover.
    bounds: KeyRange,
    /// Keys per batch (>= 1).
    batch_size: u64,
    /// Keys per sub-batch (>= 1).
    sub_batch_size: u64,
}

impl RangeBatcher {
    /// Creates a batcher; zero sizes are treated as one.
    #[must_use]
    pub fn new(bounds: KeyRange, batch_size: u64, sub_batch_size: u64) -> Self {
        Self {
            bounds,
            batch_size: batch_size.max(1),
            sub_batch_size: sub_batch_size.max(1),
        }
    }

    /// Returns the first key not yet covered, or `None` when the range is exhausted.
    ///
    /// `cursor` is the highest `max_value` of any succeeded job.
    #[must_use]
    pub fn next_start(&self, cursor: Option<i64>) -> Option<i64> {
        let start = match cursor {
            None => self.bounds.start,
            Some(covered) => covered.checked_add(1)?.max(self.bounds.start),
        };
        (start <= self.bounds.end).then_some(start)
    }

    /// Returns the next batch after `cursor`, or `None` when no work remains.
    #[must_use]
    pub fn next_batch(&self, cursor: Option<i64>) -> Option<KeyRange> {
        let start = self.next_start(cursor)?;
        self.batch_starting_at(start)
    }

    /// Returns the batch beginning at `start`, clipped to the migration bounds.
    #[must_use]
    pub fn batch_starting_at(&self, start: i64) -> Option<KeyRange> {
        if !self.bounds.contains(start) {
            return None;
        }
        let width = i64::try_from(self.batch_size - 1).unwrap_or(i64::MAX);
        let end = start.saturating_add(width).min(self.bounds.end);
        KeyRange::new(start, end)
    }

    /// Slices `batch` into sub-batches of at most `sub_batch_size` keys.
    #[must_use]
    pub const fn sub_batches(&self, batch: KeyRange) -> SubBatches {
        SubBatches::new(batch, self.sub_batch_size)
    }
}

// ============================================================================
// SECTION: Sub-Batches
// ============================================================================

/// Iterator over consecutive sub-ranges of a batch; the last one may be narrower.
#[derive(Debug, Clone)]
pub struct SubBatches {
    /// Start of the next sub-range, `None` once exhausted.
    next: Option<i64>,
    /// Inclusive end of the enclosing batch.
    end: i64,
    /// Maximum keys per sub-range (>= 1).
    width: u64,
}

impl SubBatches {
    /// Creates a sub-batch iterator over `batch`.
    #[must_use]
    pub const fn new(batch: KeyRange, width: u64) -> Self {
        Self {
            next: Some(batch.start),
            end: batch.end,
            width: if width == 0 { 1 } else { width },
        }
    }
}

impl Iterator for SubBatches {
    type Item = KeyRange;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let span = i64::try_from(self.width - 1).unwrap_or(i64::MAX);
        let stop = start.saturating_add(span).min(self.end);
        self.next = if stop >= self.end { None } else { Some(stop + 1) };
        KeyRange::new(start, stop)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64) -> KeyRange {
        KeyRange::new(start, end).unwrap_or(KeyRange {
            start,
            end: start,
        })
    }

    #[test]
    fn first_batch_starts_at_min_value() {
        let batcher = RangeBatcher::new(range(1, 50), 5, 2);
        assert_eq!(batcher.next_batch(None), Some(range(1, 5)));
        assert_eq!(batcher.next_batch(Some(5)), Some(range(6, 10)));
    }

    #[test]
    fn last_batch_is_clipped_to_max_value() {
        let batcher = RangeBatcher::new(range(1, 12), 5, 2);
        assert_eq!(batcher.next_batch(Some(10)), Some(range(11, 12)));
        assert_eq!(batcher.next_batch(Some(12)), None);
    }

    #[test]
    fn cursor_at_i64_max_is_exhausted() {
        let batcher = RangeBatcher::new(range(i64::MAX - 3, i64::MAX), 10, 10);
        assert_eq!(batcher.next_batch(None), Some(range(i64::MAX - 3, i64::MAX)));
        assert_eq!(batcher.next_batch(Some(i64::MAX)), None);
    }

    #[test]
    fn sub_batches_cover_batch_with_narrow_tail() {
        let batcher = RangeBatcher::new(range(1, 50), 5, 2);
        let slices: Vec<_> = batcher.sub_batches(range(1, 5)).collect();
        assert_eq!(slices, vec![range(1, 2), range(3, 4), range(5, 5)]);
    }

    #[test]
    fn sub_batch_wider_than_batch_yields_single_slice() {
        let slices: Vec<_> = SubBatches::new(range(7, 9), 100).collect();
        assert_eq!(slices, vec![range(7, 9)]);
    }

    #[test]
    fn len_saturates_for_full_domain() {
        assert_eq!(range(i64::MIN, i64::MAX).len(), u64::MAX);
        assert_eq!(range(3, 3).len(), 1);
    }
}
