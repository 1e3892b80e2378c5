use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

use bytemuck::Pod;

use crate::Timestamp;
use crate::arena::{Arena, LocalArena, SharedMemoryArena};
use crate::board::{Board, BoardState};
use crate::error::{Error, Result};
use crate::layout::{Header, Layout};
use crate::matrix::{SampleMatrix, offset_of};
use crate::settings::{BoardOptions, BufferSettings};

/// How often [`SampleBuffer::attach_timeout`] retries while the creator is
/// still setting up.
const ATTACH_RETRY: Duration = Duration::from_millis(10);

/// Circular `[board][beamlet][offset]` buffer of samples of type `S`,
/// shared between one receiver process and its consumers.
///
/// The buffer is addressed by unbounded timestamps; slot
/// [`offset(t)`](Self::offset) is `t mod nr_samples`. Each board carries its
/// own producer/consumer handoff, see [`Board`].
///
/// `S` is an opaque fixed-width record: the buffer copies its bytes and
/// never looks inside. Its size is part of the segment geometry.
pub struct SampleBuffer<S, A: Arena = SharedMemoryArena> {
    arena: A,
    settings: BufferSettings,
    layout: Layout,
    options: BoardOptions,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Pod> SampleBuffer<S> {
    /// Creates the segment if `create` is set, otherwise attaches to it.
    pub fn open(settings: BufferSettings, create: bool) -> Result<Self> {
        if create {
            Self::create(settings)
        } else {
            Self::attach(settings)
        }
    }

    /// Creates a fresh shared segment under `settings.shared_memory_key`
    /// and writes `settings` into it.
    ///
    /// The segment is removed when this buffer is dropped unless
    /// [`keep_segment`](Self::keep_segment) is called.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSettings`] for an unusable geometry,
    /// [`Error::SharedMemory`] if the OS refuses the segment.
    pub fn create(settings: BufferSettings) -> Result<Self> {
        let size = Self::data_size(&settings)?;
        let arena = SharedMemoryArena::create(settings.shared_memory_key, size)?;
        Self::init(arena, settings)
    }

    /// Attaches to a segment created by another process with the same
    /// settings.
    ///
    /// # Errors
    ///
    /// - [`Error::SharedMemory`] if the segment is missing or inaccessible.
    /// - [`Error::NotInitialized`], [`Error::InvalidMagic`] or
    ///   [`Error::IncompatibleVersion`] if it is not a usable sample buffer.
    /// - [`Error::ConfigMismatch`] if its geometry differs from `settings`.
    /// - [`Error::SegmentTooSmall`] if it cannot hold that geometry.
    pub fn attach(settings: BufferSettings) -> Result<Self> {
        let arena = SharedMemoryArena::attach(settings.shared_memory_key)?;
        Self::from_existing(arena, settings)
    }

    /// Like [`attach`](Self::attach), but keeps retrying for up to `timeout`
    /// while the segment does not exist yet or is still being initialized.
    pub fn attach_timeout(settings: BufferSettings, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::attach(settings) {
                Err(Error::NotInitialized | Error::SharedMemory { op: "lookup", .. })
                    if Instant::now() < deadline =>
                {
                    thread::sleep(ATTACH_RETRY);
                }
                res => return res,
            }
        }
    }

    /// Leaves the segment in place when this buffer is dropped.
    pub fn keep_segment(&mut self) {
        self.arena.set_remove_on_drop(false);
    }

    pub fn is_creator(&self) -> bool {
        self.arena.is_creator()
    }
}

impl<S: Pod> SampleBuffer<S, LocalArena> {
    /// A buffer private to this process, for single-process pipelines and
    /// tests. `shared_memory_key` is ignored.
    pub fn local(settings: BufferSettings) -> Result<Self> {
        let size = Self::data_size(&settings)?;
        let arena = LocalArena::new(size)?;
        Self::init(arena, settings)
    }
}

impl<S: Pod, A: Arena> SampleBuffer<S, A> {
    /// Bytes needed for a segment holding `settings`.
    pub fn data_size(settings: &BufferSettings) -> Result<usize> {
        Ok(Layout::new(settings, size_of::<S>(), align_of::<S>())?.total)
    }

    fn init(arena: A, settings: BufferSettings) -> Result<Self> {
        let layout = Layout::new(&settings, size_of::<S>(), align_of::<S>())?;
        if arena.size() < layout.total {
            return Err(Error::SegmentTooSmall {
                required: layout.total,
                found: arena.size(),
            });
        }

        let header = arena.as_ptr().cast::<Header>().as_ptr();
        // SAFETY: the arena is fresh, zeroed and large enough; attachers
        // ignore it until the magic is published below. Board states are
        // valid when zeroed.
        unsafe {
            Header::init(header, &settings, size_of::<S>(), layout.total);
            (*header).publish();
        }

        tracing::info!(
            nr_boards = settings.nr_boards,
            nr_beamlets_per_board = settings.nr_beamlets_per_board,
            nr_samples = settings.nr_samples,
            sync = settings.sync,
            bytes = layout.total,
            "sample buffer created"
        );
        Ok(Self {
            arena,
            settings,
            layout,
            options: BoardOptions::default(),
            _marker: PhantomData,
        })
    }

    fn from_existing(arena: A, settings: BufferSettings) -> Result<Self> {
        if arena.size() < size_of::<Header>() {
            return Err(Error::SegmentTooSmall {
                required: size_of::<Header>(),
                found: arena.size(),
            });
        }
        // SAFETY: the mapping holds at least a header and is page aligned.
        let header = unsafe { arena.as_ptr().cast::<Header>().as_ref() };
        header.validate(&settings, size_of::<S>())?;

        let layout = Layout::new(&settings, size_of::<S>(), align_of::<S>())?;
        let found = arena.size().min(header.data_size());
        if found < layout.total {
            return Err(Error::SegmentTooSmall {
                required: layout.total,
                found,
            });
        }

        tracing::info!(
            key = settings.shared_memory_key,
            nr_boards = settings.nr_boards,
            sync = settings.sync,
            "sample buffer attached"
        );
        Ok(Self {
            arena,
            settings,
            layout,
            options: BoardOptions::default(),
            _marker: PhantomData,
        })
    }

    /// Sets the process-local options used by every [`Board`] handed out
    /// afterwards.
    pub fn with_options(mut self, options: BoardOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BoardOptions {
        &self.options
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Slot of `timestamp`: `timestamp mod nr_samples`, in `[0, nr_samples)`.
    #[inline(always)]
    pub fn offset(&self, timestamp: Timestamp) -> usize {
        offset_of(timestamp, self.settings.nr_samples)
    }

    pub fn nr_boards(&self) -> usize {
        self.settings.nr_boards as usize
    }

    /// The sample matrix. Who may touch which slots is decided by the
    /// boards.
    pub fn matrix(&self) -> SampleMatrix<'_, S> {
        let base = self.base_at(self.layout.matrix_offset).cast::<S>();
        // SAFETY: `Layout` reserved exactly this many aligned samples at
        // `matrix_offset`, and they live as long as the arena.
        unsafe {
            SampleMatrix::new(
                base,
                self.settings.nr_boards as usize,
                self.settings.nr_beamlets_per_board as usize,
                self.settings.nr_samples as usize,
            )
        }
    }

    /// Handle on board `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= nr_boards`.
    pub fn board(&self, index: usize) -> Board<'_, S> {
        assert!(
            index < self.nr_boards(),
            "board {index} out of range (nr_boards = {})",
            self.nr_boards()
        );
        let state = self.base_at(self.layout.board_offset(index)).cast::<BoardState>();
        // SAFETY: board states are laid out back to back after the matrix,
        // start zeroed (a valid state) and are only mutated through atomics.
        let state = unsafe { state.as_ref() };
        Board::new(
            index,
            state,
            self.matrix(),
            self.settings.nr_samples,
            self.settings.sync,
            self.options,
        )
    }

    pub fn boards(&self) -> impl Iterator<Item = Board<'_, S>> + '_ {
        (0..self.nr_boards()).map(move |i| self.board(i))
    }

    /// Closes both sides of every board, releasing anything blocked on this
    /// buffer.
    pub fn close_all(&self) {
        for board in self.boards() {
            board.no_more_writing();
            board.no_more_reading();
        }
    }

    fn base_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.arena.size());
        unsafe { self.arena.as_ptr().add(offset) }
    }
}

impl<S, A: Arena> std::fmt::Debug for SampleBuffer<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("settings", &self.settings)
            .field("bytes", &self.layout.total)
            .finish()
    }
}
