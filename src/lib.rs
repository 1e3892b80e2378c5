//! # Sample Buffer
//!
//! A shared-memory circular buffer that decouples a receiver ingesting
//! per-antenna sample streams from many independent hardware sources
//! ("boards") from the real-time consumers (correlators, beamformers) that
//! read them at their own pace.
//!
//! One process creates the segment; receivers and consumers in other
//! processes attach to it with the same [`BufferSettings`]. The segment holds
//! a `[board][beamlet][offset]` sample matrix addressed by unbounded
//! timestamps (`offset = timestamp mod nr_samples`) plus, per board, the
//! state of its producer/consumer handoff.
//!
//! ## Operating modes
//!
//! - **Sync mode**: lockstep and lossless. A reader's
//!   [`Board::start_read`] sleeps until the writer has published the window;
//!   a writer's [`Board::start_write`] sleeps until the reader has released
//!   the slots it is about to reuse. `nr_samples` is the queue depth of every
//!   board.
//!
//! - **Free-running mode**: nothing ever blocks. The writer overwrites old
//!   data regardless of the reader, and the reader consults
//!   [`Board::has_data`] to find out what survived. Falling behind loses data
//!   instead of stalling the pipeline.
//!
//! ## Blocking behavior
//!
//! Waits are kernel sleeps on futex words inside the segment, woken by the
//! other side's pointer advance, so a waiting process uses no CPU. Waits can
//! be bounded with [`BoardOptions::wait_timeout`]; expiry closes that board
//! for both sides, and every later call on it reports
//! [`Handoff::EndOfStream`] rather than an error.
//! Boards are fully independent: no lock is shared between them.
//!
//! ## Example
//!
//! ```no_run
//! use sample_buffer::{BufferSettings, Handoff, SampleBuffer};
//!
//! # fn main() -> sample_buffer::Result<()> {
//! let settings = BufferSettings::new(2, 4, 1024).with_sync(true).with_key(0x5342);
//! let buffer = SampleBuffer::<[i16; 2]>::create(settings)?;
//!
//! // Receiver side
//! let board = buffer.board(0);
//! if board.start_write(0, 16)?.is_ready() {
//!     for beamlet in 0..4 {
//!         board.write_samples(beamlet, 0, &[[0, 0]; 16]);
//!     }
//! }
//! board.stop_write(16)?;
//!
//! // Consumer side, usually another process
//! if board.start_read(0, 16)? == Handoff::Ready {
//!     let mut samples = [[0i16; 2]; 16];
//!     board.read_samples(0, 0, &mut samples);
//! }
//! board.stop_read(16)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`SampleBuffer`]: create/attach, geometry checks, boards.
//! - [`Board`]: the per-board write and read protocol.
//! - [`SlidingPointer`]: monotone cross-process value with blocking waits.
//! - [`Ranges`]: interval set of valid slots.
//! - [`Arena`]: the raw mapped regions everything is carved from.
//!
//! ## License
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only supports Linux (it relies on futexes in shared memory).");

mod arena;
mod board;
mod buffer;
mod error;
mod futex;
mod layout;
mod matrix;
mod ranges;
mod settings;
mod sliding_pointer;

/// Sample time, in samples since an arbitrary epoch. Grows monotonically
/// and is never wrapped; the buffer wraps it into slots.
pub type Timestamp = i64;

pub use arena::{Arena, LocalArena, SharedMemoryArena};
pub use board::{Board, BoardStatus, Handoff};
pub use buffer::SampleBuffer;
pub use error::{Error, ProtocolViolation, Result};
pub use layout::{LAYOUT_VERSION, MAGIC};
pub use matrix::{SampleMatrix, offset_of};
pub use ranges::{RANGES_CAPACITY, Ranges};
pub use settings::{BoardOptions, BufferSettings, DEFAULT_KEY, ViolationPolicy};
pub use sliding_pointer::{PointerValue, Regression, SlidingPointer};
