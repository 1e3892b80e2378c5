use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytemuck::Pod;
use crossbeam_utils::CachePadded;

use crate::Timestamp;
use crate::error::{Error, ProtocolViolation, Result};
use crate::matrix::{SampleMatrix, offset_of};
use crate::ranges::{Ranges, SharedRanges};
use crate::settings::{BoardOptions, ViolationPolicy};
use crate::sliding_pointer::{PointerValue, SlidingPointer};

const WRITING: u32 = 1 << 0;
const READING: u32 = 1 << 1;
const WRITE_CLOSED: u32 = 1 << 2;
const READ_CLOSED: u32 = 1 << 3;
/// Set together with both close bits when a wait timed out. Operations on an
/// expired board report end-of-stream instead of protocol violations.
const EXPIRED: u32 = 1 << 4;

/// Timestamp words below start out zeroed, which decodes to this.
const UNSET: Timestamp = Timestamp::MIN;

/// Per-board bookkeeping inside the shared segment.
///
/// ```text
/// [ write_ptr (cache line) | read_ptr (cache line) | flags, origin,
///   write window, published end | available ranges ]
/// ```
///
/// All-zero bytes are the initial state: both pointers and every timestamp
/// word unset, no flags, no valid ranges.
#[repr(C)]
pub(crate) struct BoardState {
    /// Advanced by the writer after publishing; the reader waits on it.
    write_ptr: CachePadded<SlidingPointer<Timestamp>>,
    /// Advanced by the reader after consuming; the writer waits on it.
    read_ptr: CachePadded<SlidingPointer<Timestamp>>,
    flags: AtomicU32,
    _pad: u32,
    /// First timestamp ever written. Windows before it count as both
    /// published and consumed.
    origin: AtomicU64,
    write_begin: AtomicU64,
    write_end: AtomicU64,
    /// End of the last completed write.
    published_end: AtomicU64,
    available: SharedRanges,
}

const _: () = assert!(size_of::<BoardState>() % 8 == 0);

#[inline(always)]
fn load_ts(word: &AtomicU64) -> Timestamp {
    Timestamp::from_bits(word.load(Ordering::Acquire))
}

#[inline(always)]
fn store_ts(word: &AtomicU64, ts: Timestamp) {
    word.store(ts.to_bits(), Ordering::Release);
}

/// Whether an operation could go ahead or the other side has gone away.
///
/// End-of-stream is not an error: it is how a closed or timed-out peer is
/// reported so the caller can wind down cleanly.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Ready,
    EndOfStream,
}

impl Handoff {
    pub fn is_ready(self) -> bool {
        self == Handoff::Ready
    }

    pub fn is_eos(self) -> bool {
        self == Handoff::EndOfStream
    }
}

/// Snapshot of a board's protocol state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardStatus {
    pub writing: bool,
    pub reading: bool,
    pub write_closed: bool,
    pub read_closed: bool,
    /// Closed because a wait timed out, not by either side.
    pub expired: bool,
}

impl BoardStatus {
    /// Both sides have hung up; no call on this board blocks any more.
    pub fn is_closed(&self) -> bool {
        self.write_closed && self.read_closed
    }
}

/// Handle on one data source of a [`SampleBuffer`](crate::SampleBuffer).
///
/// Each board has exactly one writer (the receiver feeding it) and, in sync
/// mode, exactly one reader. Boards never block or affect each other.
///
/// # Write protocol
///
/// 1. [`start_write(begin, end)`](Self::start_write): in sync mode waits
///    until the reader has released the slots about to be reused, then
///    marks them invalid.
/// 2. Write samples for `[begin, end)` into the matrix.
/// 3. [`stop_write(end)`](Self::stop_write): marks the written slots valid,
///    **then** advances the write pointer. A reader that sees the write
///    pointer at `X` therefore sees every sample before `X`.
///
/// # Read protocol
///
/// 1. [`start_read(begin, end)`](Self::start_read): in sync mode waits
///    until the write pointer reaches `end`.
/// 2. Read samples for `[begin, end)`.
/// 3. [`stop_read(end)`](Self::stop_read): in sync mode advances the read
///    pointer, letting the writer reuse those slots.
///
/// In free-running mode nothing blocks; the writer overwrites whatever is
/// there and the reader consults [`has_data`](Self::has_data).
#[derive(Clone, Copy)]
pub struct Board<'a, S> {
    index: usize,
    state: &'a BoardState,
    matrix: SampleMatrix<'a, S>,
    nr_samples: u64,
    sync: bool,
    options: BoardOptions,
}

impl<'a, S: Pod> Board<'a, S> {
    pub(crate) fn new(
        index: usize,
        state: &'a BoardState,
        matrix: SampleMatrix<'a, S>,
        nr_samples: u64,
        sync: bool,
        options: BoardOptions,
    ) -> Self {
        Self {
            index,
            state,
            matrix,
            nr_samples,
            sync,
            options,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self, timestamp: Timestamp) -> usize {
        offset_of(timestamp, self.nr_samples)
    }

    // ---------------------------------------------------------------------
    // Write side
    // ---------------------------------------------------------------------

    /// Claims `[begin, end)` for writing.
    ///
    /// In sync mode, blocks until the reader has released every slot the
    /// window reuses, i.e. until the read pointer reaches
    /// `end - nr_samples`. Returns [`Handoff::EndOfStream`] if the reader
    /// has hung up or the board expired; the window is still claimed so the
    /// usual [`stop_write`](Self::stop_write) follows, but nobody will
    /// consume it.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation`] if the window is inverted or longer than the
    /// buffer, if a write is already in flight, if this writer closed
    /// writing, or, in sync mode, if `begin` lies before data already
    /// published.
    pub fn start_write(&self, begin: Timestamp, end: Timestamp) -> Result<Handoff> {
        self.check_window(begin, end)?;
        let flags = self.flags();
        if flags & WRITING != 0 {
            return Err(self.violation(ProtocolViolation::NestedWrite {
                begin: load_ts(&self.state.write_begin),
                end: load_ts(&self.state.write_end),
            }));
        }
        if flags & (WRITE_CLOSED | EXPIRED) == WRITE_CLOSED {
            return Err(self.violation(ProtocolViolation::WriteAfterClose));
        }

        self.anchor(begin);

        let mut handoff = Handoff::Ready;
        if self.sync {
            // A closed write pointer sits at the sentinel; nothing to rewrite.
            let published = self.state.write_ptr.get();
            if !self.state.write_ptr.is_closed() && begin < published {
                return Err(self.violation(ProtocolViolation::Rewrite { begin, published }));
            }
            let released = end.saturating_sub(self.nr_samples as i64);
            if !self.wait_on(&self.state.read_ptr, released) {
                self.expire("reader stalled");
            }
            if self.state.read_ptr.is_closed() {
                handoff = Handoff::EndOfStream;
            }
        } else if self.flags() & READ_CLOSED != 0 {
            handoff = Handoff::EndOfStream;
        }

        store_ts(&self.state.write_begin, begin);
        store_ts(&self.state.write_end, end);
        self.set_flags(WRITING);

        // Invalidate the slots about to be overwritten, plus any gap left
        // since the previous write, before a single byte changes.
        let published = load_ts(&self.state.published_end);
        let gap_start = if published != UNSET && published < begin {
            published
        } else {
            begin
        };
        let spans = self.spans(gap_start, end);
        self.state.available.update(|ranges| {
            for span in spans.iter().flatten() {
                ranges.exclude(span.start, span.end);
            }
        });

        Ok(handoff)
    }

    /// Publishes the samples written since [`start_write`](Self::start_write)
    /// up to `end` and hands them to the reader.
    ///
    /// `end` may be short of the window's end when only part of it was
    /// written.
    pub fn stop_write(&self, end: Timestamp) -> Result<()> {
        if self.flags() & WRITING == 0 {
            return Err(self.violation(ProtocolViolation::NotWriting { end }));
        }
        let begin = load_ts(&self.state.write_begin);
        let window_end = load_ts(&self.state.write_end);
        if end < begin || end > window_end {
            return Err(self.violation(ProtocolViolation::OutsideWriteWindow {
                begin,
                window_end,
                end,
            }));
        }

        // Data first ...
        let spans = self.spans(begin, end);
        self.state.available.update(|ranges| {
            for span in spans.iter().flatten() {
                ranges.include(span.start, span.end);
            }
        });
        store_ts(&self.state.published_end, end);
        self.clear_flags(WRITING);

        // ... then the pointer.
        if self.sync {
            self.advance(&self.state.write_ptr, "write", end)?;
        }
        Ok(())
    }

    /// Ends the stream: every current and future
    /// [`start_read`](Self::start_read) past the last published sample
    /// returns [`Handoff::EndOfStream`] without blocking.
    pub fn no_more_writing(&self) {
        let prev = self.set_flags(WRITE_CLOSED);
        self.state.write_ptr.close();
        if prev & WRITE_CLOSED == 0 {
            tracing::info!(
                board = self.index,
                published_end = load_ts(&self.state.published_end),
                "no more writing"
            );
        }
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    /// Claims `[begin, end)` for reading.
    ///
    /// In sync mode, blocks until the writer has published up to `end`.
    /// Returns [`Handoff::EndOfStream`] once writing has closed and the
    /// window reaches past the last published sample, and for every window
    /// once reading has closed or the board expired: the writer no longer
    /// respects this reader's position, so no slot is safe to trust.
    ///
    /// In free-running mode never blocks; check [`has_data`](Self::has_data)
    /// before trusting the samples.
    ///
    /// Samples of a window handed out before the board expired may have been
    /// overwritten; [`status`](Self::status) tells whether that happened.
    pub fn start_read(&self, begin: Timestamp, end: Timestamp) -> Result<Handoff> {
        self.check_window(begin, end)?;

        if self.sync && !self.wait_on(&self.state.write_ptr, end) {
            self.expire("writer stalled");
        }
        self.set_flags(READING);

        let flags = self.flags();
        if flags & READ_CLOSED != 0 {
            return Ok(Handoff::EndOfStream);
        }
        let published = load_ts(&self.state.published_end);
        if flags & WRITE_CLOSED != 0 && published < end {
            return Ok(Handoff::EndOfStream);
        }
        Ok(Handoff::Ready)
    }

    /// Releases everything before `end` back to the writer.
    pub fn stop_read(&self, end: Timestamp) -> Result<()> {
        self.clear_flags(READING);
        if !self.sync {
            return Ok(());
        }
        let origin = load_ts(&self.state.origin);
        if origin != UNSET && end <= origin {
            return Ok(());
        }
        self.advance(&self.state.read_ptr, "read", end)
    }

    /// Hangs up the reader: a writer blocked on back-pressure is released
    /// and never waits on this board again.
    pub fn no_more_reading(&self) {
        let prev = self.set_flags(READ_CLOSED);
        self.state.read_ptr.close();
        if prev & READ_CLOSED == 0 {
            tracing::info!(board = self.index, "no more reading");
        }
    }

    // ---------------------------------------------------------------------
    // Samples and diagnostics
    // ---------------------------------------------------------------------

    /// Copies `samples` for `beamlet` starting at `timestamp` into the
    /// buffer. Call between `start_write` and `stop_write`.
    pub fn write_samples(&self, beamlet: usize, timestamp: Timestamp, samples: &[S]) {
        self.matrix.write(self.index, beamlet, timestamp, samples);
    }

    /// Copies samples for `beamlet` starting at `timestamp` out of the
    /// buffer. Call between `start_read` and `stop_read`.
    pub fn read_samples(&self, beamlet: usize, timestamp: Timestamp, out: &mut [S]) {
        self.matrix.read(self.index, beamlet, timestamp, out);
    }

    /// Snapshot of the valid slots, in the offset domain.
    pub fn available(&self) -> Ranges {
        self.state.available.load()
    }

    /// Whether every slot of `[begin, end)` currently holds published data.
    ///
    /// Slots are tracked by offset, so in free-running mode a slot that has
    /// been overwritten by a later timestamp still reports valid. Readers
    /// that fall a whole ring behind see the newer samples.
    pub fn has_data(&self, begin: Timestamp, end: Timestamp) -> bool {
        let available = self.available();
        self.spans(begin, end)
            .iter()
            .flatten()
            .all(|span| available.covers(span.start, span.end))
    }

    pub fn status(&self) -> BoardStatus {
        let flags = self.flags();
        BoardStatus {
            writing: flags & WRITING != 0,
            reading: flags & READING != 0,
            write_closed: flags & WRITE_CLOSED != 0,
            read_closed: flags & READ_CLOSED != 0,
            expired: flags & EXPIRED != 0,
        }
    }

    /// Current write pointer (sync mode). Diagnostics only.
    pub fn write_pointer(&self) -> Timestamp {
        self.state.write_ptr.get()
    }

    /// Current read pointer (sync mode). Diagnostics only.
    pub fn read_pointer(&self) -> Timestamp {
        self.state.read_ptr.get()
    }

    /// End of the last completed write, if any.
    pub fn published_end(&self) -> Option<Timestamp> {
        let ts = load_ts(&self.state.published_end);
        (ts != UNSET).then_some(ts)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn flags(&self) -> u32 {
        self.state.flags.load(Ordering::Acquire)
    }

    fn set_flags(&self, bits: u32) -> u32 {
        self.state.flags.fetch_or(bits, Ordering::AcqRel)
    }

    fn clear_flags(&self, bits: u32) -> u32 {
        self.state.flags.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Pins the stream origin at the first write and moves both pointers up
    /// to it, so the writer can fill a whole ring before the reader starts.
    fn anchor(&self, begin: Timestamp) {
        let unset = UNSET.to_bits();
        if self
            .state
            .origin
            .compare_exchange(unset, begin.to_bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(board = self.index, origin = begin, "stream anchored");
            self.state.read_ptr.raise_to(begin);
            self.state.write_ptr.raise_to(begin);
        }
    }

    /// Closes the whole board after a wait timed out. Both sides see
    /// end-of-stream from now on; neither is blamed for a violation.
    fn expire(&self, reason: &'static str) {
        let prev = self.set_flags(EXPIRED | WRITE_CLOSED | READ_CLOSED);
        self.state.write_ptr.close();
        self.state.read_ptr.close();
        if prev & EXPIRED == 0 {
            tracing::warn!(board = self.index, reason, "wait timed out, closing board");
        }
    }

    /// Advances a sync-mode pointer. A pointer already closed by the peer or
    /// a timeout stays closed.
    fn advance(
        &self,
        pointer: &SlidingPointer<Timestamp>,
        name: &'static str,
        end: Timestamp,
    ) -> Result<()> {
        match pointer.advance(end) {
            Ok(()) => Ok(()),
            Err(regression) if regression.current == Timestamp::MAX => Ok(()),
            Err(regression) => Err(self.violation(ProtocolViolation::PointerRegression {
                pointer: name,
                current: regression.current,
                requested: regression.requested,
            })),
        }
    }

    /// Waits for `pointer` to reach `value`, honouring the configured
    /// timeout. Returns `false` on timeout.
    fn wait_on(&self, pointer: &SlidingPointer<Timestamp>, value: Timestamp) -> bool {
        match self.options.wait_timeout {
            Some(timeout) => pointer.wait_timeout(value, timeout),
            None => {
                pointer.wait(value);
                true
            }
        }
    }

    fn check_window(&self, begin: Timestamp, end: Timestamp) -> Result<()> {
        if end < begin {
            return Err(self.violation(ProtocolViolation::InvertedWindow { begin, end }));
        }
        if end.abs_diff(begin) > self.nr_samples {
            return Err(self.violation(ProtocolViolation::WindowTooLarge {
                begin,
                end,
                capacity: self.nr_samples,
            }));
        }
        Ok(())
    }

    /// Offset intervals covered by the timestamps `[begin, end)`, split at
    /// the end of the ring. Only the last `nr_samples` timestamps matter.
    fn spans(&self, begin: Timestamp, end: Timestamp) -> [Option<Range<u64>>; 2] {
        if end <= begin {
            return [None, None];
        }
        let n = self.nr_samples;
        if end.abs_diff(begin) >= n {
            return [Some(0..n), None];
        }
        let start = offset_of(begin, n) as u64;
        let stop = start + end.abs_diff(begin);
        if stop <= n {
            [Some(start..stop), None]
        } else {
            [Some(start..n), Some(0..stop - n)]
        }
    }

    /// Applies the violation policy. Returns the error to hand back when the
    /// policy lets the caller continue.
    fn violation(&self, violation: ProtocolViolation) -> Error {
        tracing::error!(board = self.index, %violation, "protocol violation");
        match self.options.violation_policy {
            ViolationPolicy::Panic => panic!("board {}: {violation}", self.index),
            ViolationPolicy::CloseBoard => {
                self.no_more_writing();
                self.no_more_reading();
                Error::ProtocolViolation(violation)
            }
        }
    }
}

impl<S> std::fmt::Debug for Board<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("index", &self.index)
            .field("sync", &self.sync)
            .field("write_ptr", &*self.state.write_ptr)
            .field("read_ptr", &*self.state.read_ptr)
            .field("flags", &self.state.flags.load(Ordering::Relaxed))
            .finish()
    }
}
