//! Interval sets over the buffer offset domain.
//!
//! [`Ranges`] is the ordinary in-process value; [`SharedRanges`] is its
//! fixed-capacity image inside the shared segment, updated by the single
//! writer of a board and read concurrently by any process through a
//! sequence lock:
//!
//! 1. **Writer**: bump the sequence to ODD, rewrite the table, bump to EVEN.
//! 2. **Reader**: read an EVEN sequence, copy the table, re-read the
//!    sequence and retry if it changed.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Maximum number of disjoint intervals a board can publish.
pub const RANGES_CAPACITY: usize = 64;

/// Reads of the shared table attempted before giving up on a writer that
/// stopped halfway through an update.
const LOAD_RETRIES: u32 = 100_000;
/// Retries spent spinning before yielding the CPU.
const LOAD_SPINS: u32 = 64;

/// An ordered set of disjoint, non-adjacent half-open intervals.
///
/// Wraparound is the caller's concern: a range that crosses the end of the
/// buffer must be inserted as two intervals.
///
/// Lookups are binary searches. `include` and `exclude` locate their span in
/// O(log n) but shift the tail of the vector, so they are O(n); with at most
/// [`RANGES_CAPACITY`] intervals per board that shift stays within one or two
/// cache lines.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Ranges {
    intervals: Vec<Range<u64>>,
}

impl Ranges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `[begin, end)` as present, merging with any overlapping or
    /// touching intervals.
    pub fn include(&mut self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }
        let first = self.intervals.partition_point(|r| r.end < begin);
        let last = self.intervals.partition_point(|r| r.start <= end);
        let merged = if first < last {
            self.intervals[first].start.min(begin)..self.intervals[last - 1].end.max(end)
        } else {
            begin..end
        };
        self.intervals.splice(first..last, [merged]);
    }

    /// Marks `[begin, end)` as absent, splitting any interval it cuts.
    pub fn exclude(&mut self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }
        let first = self.intervals.partition_point(|r| r.end <= begin);
        let last = self.intervals.partition_point(|r| r.start < end);
        if first >= last {
            return;
        }
        let head = self.intervals[first].start..begin;
        let tail = end..self.intervals[last - 1].end;
        let remnants = [head, tail].into_iter().filter(|r| !r.is_empty());
        self.intervals.splice(first..last, remnants);
    }

    pub fn contains(&self, point: u64) -> bool {
        let idx = self.intervals.partition_point(|r| r.end <= point);
        self.intervals.get(idx).is_some_and(|r| r.start <= point)
    }

    /// Whether every point of `[begin, end)` is present. Empty ranges are
    /// trivially covered.
    pub fn covers(&self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return true;
        }
        let idx = self.intervals.partition_point(|r| r.end <= begin);
        self.intervals
            .get(idx)
            .is_some_and(|r| r.start <= begin && r.end >= end)
    }

    /// Whether any point of `[begin, end)` is present.
    pub fn intersects(&self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return false;
        }
        let idx = self.intervals.partition_point(|r| r.end <= begin);
        self.intervals.get(idx).is_some_and(|r| r.start < end)
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.intervals.iter().cloned()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }
}

impl fmt::Debug for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.intervals.iter()).finish()
    }
}

/// A [`Ranges`] stored in shared memory.
///
/// All-zero bytes are a valid empty table.
#[repr(C)]
pub(crate) struct SharedRanges {
    sequence: AtomicU64,
    len: AtomicU64,
    bounds: [[AtomicU64; 2]; RANGES_CAPACITY],
}

impl SharedRanges {
    /// Consistent snapshot of the table.
    ///
    /// If no consistent snapshot shows up after [`LOAD_RETRIES`] attempts
    /// (the writer died mid-update) the table is reported empty: valid data
    /// may be under-reported, never over-reported.
    pub(crate) fn load(&self) -> Ranges {
        let mut intervals = Vec::with_capacity(8);
        for attempt in 0..LOAD_RETRIES {
            let seq = self.sequence.load(Ordering::Acquire);
            if seq & 1 == 1 {
                if attempt < LOAD_SPINS {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                continue;
            }
            intervals.clear();
            let len = (self.len.load(Ordering::Relaxed) as usize).min(RANGES_CAPACITY);
            for [start, end] in &self.bounds[..len] {
                intervals.push(start.load(Ordering::Relaxed)..end.load(Ordering::Relaxed));
            }
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == seq {
                return Ranges { intervals };
            }
        }
        tracing::warn!("valid ranges stuck mid-update, reporting none");
        Ranges::new()
    }

    /// Replaces the table. Only the board's writer may call this.
    ///
    /// If `ranges` holds more than [`RANGES_CAPACITY`] intervals the
    /// smallest ones are dropped, so the table may under-report valid data
    /// but never over-report it.
    pub(crate) fn store(&self, ranges: &Ranges) {
        let kept = if ranges.len() > RANGES_CAPACITY {
            let mut by_size: Vec<_> = ranges.iter().collect();
            by_size.sort_by_key(|r| std::cmp::Reverse(r.end - r.start));
            by_size.truncate(RANGES_CAPACITY);
            by_size.sort_by_key(|r| r.start);
            tracing::warn!(
                intervals = ranges.len(),
                capacity = RANGES_CAPACITY,
                "too many disjoint valid ranges, dropping the smallest"
            );
            by_size
        } else {
            ranges.iter().collect()
        };

        // Rounding down repairs a sequence left odd by a writer that died
        // mid-update.
        let seq = self.sequence.load(Ordering::Relaxed) & !1;
        self.sequence.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, r) in self.bounds.iter().zip(&kept) {
            slot[0].store(r.start, Ordering::Relaxed);
            slot[1].store(r.end, Ordering::Relaxed);
        }
        self.len.store(kept.len() as u64, Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Applies `f` to the current table and publishes the result.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Ranges)) {
        let mut ranges = self.load();
        f(&mut ranges);
        self.store(&ranges);
    }
}
