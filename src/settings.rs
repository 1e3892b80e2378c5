use std::time::Duration;

use crate::error::{Error, Result};

/// Default SysV key used when none is given.
pub const DEFAULT_KEY: i32 = 0x1234_5678;

/// Static geometry of a sample buffer.
///
/// Every process attached to the same segment must use identical settings;
/// the creator embeds them in the segment header and attachers compare
/// against it (see [`SampleBuffer::attach`](crate::SampleBuffer::attach)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    /// Number of independent data sources.
    pub nr_boards: u32,
    /// Beamlets carried by each board.
    pub nr_beamlets_per_board: u32,
    /// Capacity along time, i.e. the queue depth of every board.
    pub nr_samples: u64,
    /// Lockstep mode: writers and readers block on each other.
    pub sync: bool,
    /// SysV IPC key of the shared segment.
    pub shared_memory_key: i32,
}

impl BufferSettings {
    /// Free-running settings on [`DEFAULT_KEY`].
    pub fn new(nr_boards: u32, nr_beamlets_per_board: u32, nr_samples: u64) -> Self {
        Self {
            nr_boards,
            nr_beamlets_per_board,
            nr_samples,
            sync: false,
            shared_memory_key: DEFAULT_KEY,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_key(mut self, key: i32) -> Self {
        self.shared_memory_key = key;
        self
    }

    /// Number of beamlet rows in the sample matrix.
    pub fn nr_rows(&self) -> usize {
        self.nr_boards as usize * self.nr_beamlets_per_board as usize
    }

    /// Checks that the geometry describes a non-empty, addressable buffer.
    pub fn validate(&self) -> Result<()> {
        if self.nr_boards == 0 {
            return Err(Error::InvalidSettings("nr_boards must be > 0"));
        }
        if self.nr_beamlets_per_board == 0 {
            return Err(Error::InvalidSettings("nr_beamlets_per_board must be > 0"));
        }
        if self.nr_samples == 0 {
            return Err(Error::InvalidSettings("nr_samples must be > 0"));
        }
        if self.nr_samples > i64::MAX as u64 {
            return Err(Error::InvalidSettings("nr_samples must fit in a timestamp"));
        }
        Ok(())
    }
}

/// What a board does when its caller breaks the handoff protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationPolicy {
    /// Panic with the violation.
    Panic,
    /// Close both sides of the offending board and return the error.
    /// Other boards keep running.
    CloseBoard,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::CloseBoard
        }
    }
}

/// Process-local board behavior. Never stored in the segment, so
/// processes attached to the same buffer may differ here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardOptions {
    /// Upper bound on any blocking wait in sync mode. On expiry the whole
    /// board is closed and both sides see end-of-stream from then on.
    pub wait_timeout: Option<Duration>,
    pub violation_policy: ViolationPolicy,
}

impl BoardOptions {
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn with_violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let s = BufferSettings::new(2, 4, 1024).with_sync(true).with_key(7);
        assert_eq!(s.nr_boards, 2);
        assert_eq!(s.nr_beamlets_per_board, 4);
        assert_eq!(s.nr_samples, 1024);
        assert!(s.sync);
        assert_eq!(s.shared_memory_key, 7);
        assert_eq!(s.nr_rows(), 8);
    }

    #[test]
    fn validate_rejects_empty_geometry() {
        assert!(BufferSettings::new(0, 1, 1).validate().is_err());
        assert!(BufferSettings::new(1, 0, 1).validate().is_err());
        assert!(BufferSettings::new(1, 1, 0).validate().is_err());
        assert!(BufferSettings::new(1, 1, u64::MAX).validate().is_err());
        assert!(BufferSettings::new(1, 1, 1).validate().is_ok());
    }

    #[test]
    fn default_policy_follows_build_profile() {
        let policy = ViolationPolicy::default();
        if cfg!(debug_assertions) {
            assert_eq!(policy, ViolationPolicy::Panic);
        } else {
            assert_eq!(policy, ViolationPolicy::CloseBoard);
        }
    }
}
