use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use bytemuck::Pod;

use crate::Timestamp;

/// Slot of `timestamp` in a ring of `nr_samples` slots; always in
/// `[0, nr_samples)`, negative timestamps included.
#[inline(always)]
pub fn offset_of(timestamp: Timestamp, nr_samples: u64) -> usize {
    timestamp.rem_euclid(nr_samples as i64) as usize
}

/// View of the `[board][beamlet][offset]` sample matrix inside the segment.
///
/// Copies in and out of the matrix are unsynchronized: the board protocol,
/// not this type, decides who may touch which slots. In free-running mode a
/// reader may observe samples being overwritten, which is accepted behavior;
/// readers check [`Board::has_data`](crate::Board::has_data) afterwards.
#[derive(Clone, Copy)]
pub struct SampleMatrix<'a, S> {
    base: NonNull<S>,
    nr_boards: usize,
    nr_beamlets: usize,
    nr_samples: usize,
    _marker: PhantomData<&'a [S]>,
}

unsafe impl<S: Pod> Send for SampleMatrix<'_, S> {}
unsafe impl<S: Pod> Sync for SampleMatrix<'_, S> {}

impl<'a, S: Pod> SampleMatrix<'a, S> {
    /// # Safety
    ///
    /// `base` must point to `nr_boards * nr_beamlets * nr_samples` samples
    /// that stay mapped for `'a`.
    pub(crate) unsafe fn new(
        base: NonNull<S>,
        nr_boards: usize,
        nr_beamlets: usize,
        nr_samples: usize,
    ) -> Self {
        Self {
            base,
            nr_boards,
            nr_beamlets,
            nr_samples,
            _marker: PhantomData,
        }
    }

    pub fn nr_boards(&self) -> usize {
        self.nr_boards
    }

    pub fn nr_beamlets_per_board(&self) -> usize {
        self.nr_beamlets
    }

    pub fn nr_samples(&self) -> usize {
        self.nr_samples
    }

    #[inline(always)]
    fn row_ptr(&self, board: usize, beamlet: usize) -> *mut S {
        assert!(board < self.nr_boards, "board {board} out of range");
        assert!(beamlet < self.nr_beamlets, "beamlet {beamlet} out of range");
        let row = board * self.nr_beamlets + beamlet;
        unsafe { self.base.as_ptr().add(row * self.nr_samples) }
    }

    /// Splits `len` samples starting at `timestamp` into at most two
    /// contiguous `(slot, count)` runs.
    fn runs(&self, timestamp: Timestamp, len: usize) -> [(usize, usize); 2] {
        assert!(
            len <= self.nr_samples,
            "{len} samples do not fit in a ring of {}",
            self.nr_samples
        );
        let start = offset_of(timestamp, self.nr_samples as u64);
        let first = len.min(self.nr_samples - start);
        [(start, first), (0, len - first)]
    }

    /// Copies `samples` into the row of `(board, beamlet)` starting at the
    /// slot of `timestamp`, wrapping around the end of the ring.
    ///
    /// # Panics
    ///
    /// Panics if the indices are out of range or `samples` is longer than
    /// the ring.
    pub fn write(&self, board: usize, beamlet: usize, timestamp: Timestamp, samples: &[S]) {
        let row = self.row_ptr(board, beamlet);
        let mut src = samples.as_ptr();
        for (slot, count) in self.runs(timestamp, samples.len()) {
            unsafe {
                ptr::copy_nonoverlapping(src, row.add(slot), count);
                src = src.add(count);
            }
        }
    }

    /// Copies `out.len()` samples starting at the slot of `timestamp` out of
    /// the row of `(board, beamlet)`.
    ///
    /// # Panics
    ///
    /// Same conditions as [`write`](Self::write).
    pub fn read(&self, board: usize, beamlet: usize, timestamp: Timestamp, out: &mut [S]) {
        let row = self.row_ptr(board, beamlet);
        let mut dst = out.as_mut_ptr();
        for (slot, count) in self.runs(timestamp, out.len()) {
            unsafe {
                ptr::copy_nonoverlapping(row.add(slot), dst, count);
                dst = dst.add(count);
            }
        }
    }

    /// Zero-copy view of a whole row, indexed by offset.
    ///
    /// # Safety
    ///
    /// The caller must only look at slots the board protocol has handed to
    /// the reader (between `start_read` and `stop_read`), and must not hold
    /// the slice across a [`row_mut`](Self::row_mut) of the same row in this
    /// process.
    pub unsafe fn row(&self, board: usize, beamlet: usize) -> &'a [S] {
        unsafe { std::slice::from_raw_parts(self.row_ptr(board, beamlet), self.nr_samples) }
    }

    /// Mutable zero-copy view of a whole row, for receivers that decode
    /// straight into the buffer.
    ///
    /// # Safety
    ///
    /// The caller must only write slots inside its current write window and
    /// must be the only holder of a view of this row in this process.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, board: usize, beamlet: usize) -> &'a mut [S] {
        unsafe { std::slice::from_raw_parts_mut(self.row_ptr(board, beamlet), self.nr_samples) }
    }
}
