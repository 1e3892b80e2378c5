use std::io;

use thiserror::Error;

use crate::Timestamp;

/// Errors returned by [`SampleBuffer`](crate::SampleBuffer) and
/// [`Board`](crate::Board).
///
/// Everything except [`Error::ProtocolViolation`] happens at open time and
/// is fatal for the process that hit it.
#[derive(Error, Debug)]
pub enum Error {
    /// An OS-level shared-memory call failed.
    #[error("shared memory {op} failed for key {key:#x}: {source}")]
    SharedMemory {
        op: &'static str,
        key: i32,
        #[source]
        source: io::Error,
    },

    /// The segment exists but cannot hold the requested geometry.
    #[error("shared memory segment too small: need {required} bytes, found {found}")]
    SegmentTooSmall { required: usize, found: usize },

    /// The segment does not start with the sample buffer magic.
    #[error("invalid magic in shared memory segment")]
    InvalidMagic,

    /// The segment was laid out by an incompatible build.
    #[error("incompatible segment layout: expected version {expected}, found {found}")]
    IncompatibleVersion { expected: u32, found: u32 },

    /// The segment exists but its creator has not finished writing the header.
    #[error("shared memory segment is not initialized yet")]
    NotInitialized,

    /// Another process created the segment with different geometry.
    #[error("configuration mismatch on {field}: ours is {ours}, segment has {theirs}")]
    ConfigMismatch {
        field: &'static str,
        ours: u64,
        theirs: u64,
    },

    #[error("invalid buffer settings: {0}")]
    InvalidSettings(&'static str),

    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),
}

/// Caller bugs in the board handoff protocol.
///
/// These are never retried. Depending on the
/// [`ViolationPolicy`](crate::ViolationPolicy) they either panic or close the
/// offending board.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{pointer} pointer moved backwards from {current} to {requested}")]
    PointerRegression {
        pointer: &'static str,
        current: Timestamp,
        requested: Timestamp,
    },

    #[error("window [{begin}, {end}) ends before it begins")]
    InvertedWindow { begin: Timestamp, end: Timestamp },

    #[error("window [{begin}, {end}) is larger than the buffer capacity {capacity}")]
    WindowTooLarge {
        begin: Timestamp,
        end: Timestamp,
        capacity: u64,
    },

    /// Sync mode only: the writer went back over data it already published.
    #[error("write at {begin} overwrites data published up to {published}")]
    Rewrite {
        begin: Timestamp,
        published: Timestamp,
    },

    #[error("start_write while a write of [{begin}, {end}) is in flight")]
    NestedWrite { begin: Timestamp, end: Timestamp },

    #[error("stop_write({end}) without a write in flight")]
    NotWriting { end: Timestamp },

    #[error("stop_write({end}) outside the write window [{begin}, {window_end})")]
    OutsideWriteWindow {
        begin: Timestamp,
        window_end: Timestamp,
        end: Timestamp,
    },

    #[error("start_write after no_more_writing")]
    WriteAfterClose,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shm(op: &'static str, key: i32) -> Self {
        Self::SharedMemory {
            op,
            key,
            source: io::Error::last_os_error(),
        }
    }
}
