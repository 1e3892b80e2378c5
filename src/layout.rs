//! Byte layout of the shared segment.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Header (64 bytes): magic, version, sample size, settings    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Sample matrix                                               │
//! │    nr_boards × nr_beamlets_per_board rows                    │
//! │    each row nr_samples × sample_size bytes                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Board states (nr_boards × BoardState)                       │
//! │    write/read pointers, flags, windows, valid ranges         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything after the header is addressed by offsets from the start of the
//! segment, never by pointers, since each process maps it elsewhere.

use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::board::BoardState;
use crate::error::{Error, Result};
use crate::settings::BufferSettings;

/// "SMPLBUF\0", written last by the creator.
pub const MAGIC: u64 = u64::from_le_bytes(*b"SMPLBUF\0");

/// Bumped whenever the byte layout changes.
pub const LAYOUT_VERSION: u32 = 1;

const CACHE_LINE: usize = 64;

#[repr(C, align(64))]
pub(crate) struct Header {
    magic: AtomicU64,
    version: u32,
    sample_size: u32,
    nr_boards: u32,
    nr_beamlets_per_board: u32,
    nr_samples: u64,
    sync: u32,
    shared_memory_key: i32,
    data_size: u64,
}

const _: () = assert!(size_of::<Header>() == 64);

impl Header {
    /// Writes the settings into a zeroed header, leaving the magic unset.
    ///
    /// # Safety
    ///
    /// `header` must point to writable memory that no other process
    /// interprets until [`Header::publish`] has been called.
    pub(crate) unsafe fn init(
        header: *mut Header,
        settings: &BufferSettings,
        sample_size: usize,
        data_size: usize,
    ) {
        unsafe {
            header.write(Header {
                magic: AtomicU64::new(0),
                version: LAYOUT_VERSION,
                sample_size: sample_size as u32,
                nr_boards: settings.nr_boards,
                nr_beamlets_per_board: settings.nr_beamlets_per_board,
                nr_samples: settings.nr_samples,
                sync: settings.sync as u32,
                shared_memory_key: settings.shared_memory_key,
                data_size: data_size as u64,
            });
        }
    }

    /// Makes the segment visible to attachers. Everything written before is
    /// visible to an attacher that observes the magic.
    pub(crate) fn publish(&self) {
        self.magic.store(MAGIC, Ordering::Release);
    }

    /// Checks magic and version first, then that the embedded geometry
    /// matches `settings`.
    pub(crate) fn validate(&self, settings: &BufferSettings, sample_size: usize) -> Result<()> {
        match self.magic.load(Ordering::Acquire) {
            0 => return Err(Error::NotInitialized),
            MAGIC => {}
            _ => return Err(Error::InvalidMagic),
        }
        if self.version != LAYOUT_VERSION {
            return Err(Error::IncompatibleVersion {
                expected: LAYOUT_VERSION,
                found: self.version,
            });
        }

        let fields: [(&'static str, u64, u64); 5] = [
            ("sample_size", sample_size as u64, self.sample_size as u64),
            ("nr_boards", settings.nr_boards as u64, self.nr_boards as u64),
            (
                "nr_beamlets_per_board",
                settings.nr_beamlets_per_board as u64,
                self.nr_beamlets_per_board as u64,
            ),
            ("nr_samples", settings.nr_samples, self.nr_samples),
            ("sync", settings.sync as u64, self.sync as u64),
        ];
        for (field, ours, theirs) in fields {
            if ours != theirs {
                return Err(Error::ConfigMismatch { field, ours, theirs });
            }
        }
        Ok(())
    }

    /// The settings the creator wrote.
    pub(crate) fn settings(&self) -> BufferSettings {
        BufferSettings {
            nr_boards: self.nr_boards,
            nr_beamlets_per_board: self.nr_beamlets_per_board,
            nr_samples: self.nr_samples,
            sync: self.sync != 0,
            shared_memory_key: self.shared_memory_key,
        }
    }

    pub(crate) fn data_size(&self) -> usize {
        self.data_size as usize
    }
}

/// Byte offsets of every part of the segment for one geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub matrix_offset: usize,
    /// Bytes per beamlet row.
    pub row_stride: usize,
    pub boards_offset: usize,
    pub total: usize,
}

impl Layout {
    pub(crate) fn new(
        settings: &BufferSettings,
        sample_size: usize,
        sample_align: usize,
    ) -> Result<Self> {
        settings.validate()?;
        let overflow = Error::InvalidSettings("buffer size overflows the address space");

        let matrix_offset = align_up(size_of::<Header>(), sample_align.max(CACHE_LINE));
        let row_stride = usize::try_from(settings.nr_samples)
            .ok()
            .and_then(|n| n.checked_mul(sample_size))
            .ok_or(Error::InvalidSettings("row size overflows the address space"))?;
        let matrix_size = row_stride.checked_mul(settings.nr_rows()).ok_or(overflow)?;
        let matrix_end = matrix_offset
            .checked_add(matrix_size)
            .ok_or(Error::InvalidSettings("matrix end overflows the address space"))?;
        let boards_offset = align_up(matrix_end, align_of::<BoardState>().max(CACHE_LINE));
        let total = size_of::<BoardState>()
            .checked_mul(settings.nr_boards as usize)
            .and_then(|n| n.checked_add(boards_offset))
            .ok_or(Error::InvalidSettings("board state overflows the address space"))?;

        Ok(Self {
            matrix_offset,
            row_stride,
            boards_offset,
            total,
        })
    }

    pub(crate) fn board_offset(&self, board: usize) -> usize {
        self.boards_offset + board * size_of::<BoardState>()
    }
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}
