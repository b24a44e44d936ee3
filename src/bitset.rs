//! Byte-range sets for zero-filler bookkeeping.
//!
//! A [`ByteMask`] records which bytes of one memory object are known to be
//! zero. The heap graph computes them from zero-filler edges, and the join and
//! abstraction engines intersect them to decide which null bytes survive.
//!
//! Objects can be gigabytes large (external allocations default to `i32::MAX`
//! bytes), so the mask stores maximal runs instead of one bit per byte. Every
//! operation is linear in the number of runs.

use std::ops::Range;

/// A set of byte offsets, stored as sorted, disjoint, non-adjacent ranges.
///
/// # Invariants
///
/// - Runs are non-empty and sorted by start
/// - `runs[i].end < runs[i + 1].start` (touching runs are merged)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteMask {
    runs: Vec<Range<u64>>,
}

impl ByteMask {
    /// Creates an empty mask.
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// Creates a mask with exactly the bytes of `range` set.
    pub fn from_range(range: Range<u64>) -> Self {
        let mut mask = Self::new();
        mask.insert_range(range);
        mask
    }

    /// Returns the number of set bytes.
    pub fn len(&self) -> u64 {
        self.runs.iter().map(|r| r.end - r.start).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Index of the first run ending after `offset`.
    fn first_run_after(&self, offset: u64) -> usize {
        self.runs.partition_point(|r| r.end <= offset)
    }

    /// Returns true if the byte at `index` is set.
    pub fn contains(&self, index: u64) -> bool {
        self.runs.get(self.first_run_after(index)).is_some_and(|r| r.start <= index)
    }

    pub fn insert_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        // Runs touching `range` on either side are absorbed.
        let lo = self.runs.partition_point(|r| r.end < range.start);
        let hi = self.runs.partition_point(|r| r.start <= range.end);
        let mut merged = range;
        if lo < hi {
            merged.start = merged.start.min(self.runs[lo].start);
            merged.end = merged.end.max(self.runs[hi - 1].end);
        }
        self.runs.splice(lo..hi, std::iter::once(merged));
    }

    pub fn remove_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let lo = self.first_run_after(range.start);
        let hi = self.runs.partition_point(|r| r.start < range.end);
        if lo >= hi {
            return;
        }
        let mut kept = Vec::with_capacity(2);
        if self.runs[lo].start < range.start {
            kept.push(self.runs[lo].start..range.start);
        }
        if self.runs[hi - 1].end > range.end {
            kept.push(range.end..self.runs[hi - 1].end);
        }
        self.runs.splice(lo..hi, kept);
    }

    /// Returns true if every byte of `range` is set. An empty range is always covered.
    pub fn contains_range(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        self.runs
            .get(self.first_run_after(range.start))
            .is_some_and(|r| r.start <= range.start && range.end <= r.end)
    }

    /// Bytes set in both masks.
    pub fn intersection(&self, other: &ByteMask) -> ByteMask {
        let mut runs = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() && j < other.runs.len() {
            let (a, b) = (&self.runs[i], &other.runs[j]);
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                runs.push(start..end);
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        ByteMask { runs }
    }

    /// Bytes set in `self` but not in `other`.
    pub fn difference(&self, other: &ByteMask) -> ByteMask {
        let mut result = self.clone();
        for run in &other.runs {
            if result.is_empty() {
                break;
            }
            result.remove_range(run.clone());
        }
        result
    }

    /// Returns true if every byte of `self` is also set in `other`.
    pub fn is_subset(&self, other: &ByteMask) -> bool {
        self.runs.iter().all(|run| other.contains_range(run.clone()))
    }

    /// Returns an iterator over the runs, in increasing order.
    pub fn iter(&self) -> std::slice::Iter<'_, Range<u64>> {
        self.runs.iter()
    }

    /// Maximal runs of consecutive set bytes, in increasing order.
    ///
    /// Each run becomes one zero-filler edge when a mask is turned back into edges.
    pub fn runs(&self) -> Vec<Range<u64>> {
        self.runs.clone()
    }
}

impl FromIterator<Range<u64>> for ByteMask {
    fn from_iter<I: IntoIterator<Item = Range<u64>>>(iter: I) -> Self {
        let mut mask = ByteMask::new();
        for range in iter {
            mask.insert_range(range);
        }
        mask
    }
}
