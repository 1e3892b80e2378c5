use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::futex::{futex_wait, futex_wake_all};

/// A value a [`SlidingPointer`] can hold.
///
/// Values are stored as `u64` bits whose unsigned order matches the order of
/// `Self`, so all-zero memory always decodes to [`PointerValue::MIN`].
pub trait PointerValue: Copy + Ord + Debug + fmt::Display {
    /// Value of a zero-initialized pointer.
    const MIN: Self;
    /// End-of-stream sentinel. A pointer at `MAX` satisfies every wait.
    const MAX: Self;

    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

const SIGN_BIT: u64 = 1 << 63;

impl PointerValue for i64 {
    const MIN: Self = i64::MIN;
    const MAX: Self = i64::MAX;

    #[inline(always)]
    fn to_bits(self) -> u64 {
        (self as u64) ^ SIGN_BIT
    }

    #[inline(always)]
    fn from_bits(bits: u64) -> Self {
        (bits ^ SIGN_BIT) as i64
    }
}

impl PointerValue for u64 {
    const MIN: Self = 0;
    const MAX: Self = u64::MAX;

    #[inline(always)]
    fn to_bits(self) -> u64 {
        self
    }

    #[inline(always)]
    fn from_bits(bits: u64) -> Self {
        bits
    }
}

/// Returned when a pointer is asked to move backwards.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("pointer moved backwards from {current} to {requested}")]
pub struct Regression<T: PointerValue> {
    pub current: T,
    pub requested: T,
}

/// A monotone value one side advances and the other side waits on.
///
/// The pointer lives in shared memory as plain words, so it may be placed in
/// a segment mapped at different addresses by different processes. Layout:
///
/// ```text
/// [ value: u64 (order-preserving bits) | sequence: u32 | waiters: u32 ]
/// ```
///
/// - `value` only ever grows.
/// - `sequence` is bumped on every advance and is the futex word waiters
///   sleep on.
/// - `waiters` counts threads inside [`wait`](Self::wait), letting
///   [`advance`](Self::advance) skip the wake syscall when nobody sleeps.
///
/// Waiting is a real kernel sleep, not a poll loop, and
/// [`close`](Self::close) advances to the `MAX` sentinel to release every
/// waiter permanently.
#[repr(C)]
pub struct SlidingPointer<T> {
    value: AtomicU64,
    sequence: AtomicU32,
    waiters: AtomicU32,
    _marker: PhantomData<T>,
}

// SAFETY: all state is atomics; `T` is only a decoding tag.
unsafe impl<T> Send for SlidingPointer<T> {}
unsafe impl<T> Sync for SlidingPointer<T> {}

impl<T: PointerValue> Default for SlidingPointer<T> {
    fn default() -> Self {
        Self::new(T::MIN)
    }
}

impl<T: PointerValue> SlidingPointer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: AtomicU64::new(initial.to_bits()),
            sequence: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            _marker: PhantomData,
        }
    }

    /// Snapshot of the current value.
    ///
    /// For diagnostics: the value may have moved by the time it is looked
    /// at. Only the side that advances the pointer may base decisions on it.
    #[inline(always)]
    pub fn get(&self) -> T {
        T::from_bits(self.value.load(Ordering::Acquire))
    }

    /// Moves the pointer to `value` and wakes all waiters.
    ///
    /// Everything written before this call is visible to a thread whose
    /// [`wait`](Self::wait) for a value `<= value` returns.
    ///
    /// # Errors
    ///
    /// Returns [`Regression`] and leaves the pointer unchanged if `value` is
    /// below the current value.
    pub fn advance(&self, value: T) -> Result<(), Regression<T>> {
        let bits = value.to_bits();
        let prev = self.value.fetch_max(bits, Ordering::SeqCst);
        if bits < prev {
            return Err(Regression {
                current: T::from_bits(prev),
                requested: value,
            });
        }
        if bits != prev {
            self.notify();
        }
        Ok(())
    }

    /// Moves the pointer to at least `value`; never fails.
    pub(crate) fn raise_to(&self, value: T) {
        let bits = value.to_bits();
        if self.value.fetch_max(bits, Ordering::SeqCst) < bits {
            self.notify();
        }
    }

    /// Advances to the end-of-stream sentinel, releasing every current and
    /// future waiter.
    pub fn close(&self) {
        self.raise_to(T::MAX);
    }

    pub fn is_closed(&self) -> bool {
        self.get() == T::MAX
    }

    /// Blocks until the pointer reaches `value`.
    ///
    /// Returns immediately once the pointer is closed.
    pub fn wait(&self, value: T) {
        self.wait_until(value, None);
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `true` if the pointer reached `value`.
    pub fn wait_timeout(&self, value: T, timeout: Duration) -> bool {
        self.wait_until(value, Some(Instant::now() + timeout))
    }

    fn wait_until(&self, value: T, deadline: Option<Instant>) -> bool {
        let bits = value.to_bits();
        if self.value.load(Ordering::Acquire) >= bits {
            return true;
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let reached = loop {
            let seq = self.sequence.load(Ordering::SeqCst);
            if self.value.load(Ordering::SeqCst) >= bits {
                break true;
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(d) if !d.is_zero() => Some(d),
                    _ => break false,
                },
                None => None,
            };
            futex_wait(&self.sequence, seq, remaining);
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        reached
    }

    fn notify(&self) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) != 0 {
            futex_wake_all(&self.sequence);
        }
    }
}

impl<T: PointerValue> Debug for SlidingPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingPointer")
            .field("value", &self.get())
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn bits_preserve_signed_order() {
        let values = [i64::MIN, -1_000, -1, 0, 1, 1_000, i64::MAX];
        for pair in values.windows(2) {
            assert!(pair[0].to_bits() < pair[1].to_bits());
            assert_eq!(i64::from_bits(pair[0].to_bits()), pair[0]);
        }
        assert_eq!(i64::MIN.to_bits(), 0, "zeroed memory must decode to MIN");
    }

    #[test]
    fn default_is_min() {
        let p = SlidingPointer::<i64>::default();
        assert_eq!(p.get(), i64::MIN);
        assert!(!p.is_closed());
    }

    #[test]
    fn advance_moves_forward() {
        let p = SlidingPointer::new(0i64);
        p.advance(10).unwrap();
        p.advance(10).unwrap();
        p.advance(25).unwrap();
        assert_eq!(p.get(), 25);
    }

    #[test]
    fn advance_backwards_is_rejected() {
        let p = SlidingPointer::new(100i64);
        let err = p.advance(99).unwrap_err();
        assert_eq!(
            err,
            Regression {
                current: 100,
                requested: 99
            }
        );
        assert_eq!(p.get(), 100, "failed advance must not move the pointer");
    }

    #[test]
    fn raise_to_ignores_lower_values() {
        let p = SlidingPointer::new(50u64);
        p.raise_to(10);
        assert_eq!(p.get(), 50);
        p.raise_to(60);
        assert_eq!(p.get(), 60);
    }

    #[test]
    fn wait_returns_when_already_reached() {
        let p = SlidingPointer::new(5i64);
        p.wait(5);
        p.wait(-3);
        assert!(p.wait_timeout(5, Duration::ZERO));
    }

    #[test]
    fn wait_timeout_expires() {
        let p = SlidingPointer::new(0i64);
        let start = Instant::now();
        assert!(!p.wait_timeout(1, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn advance_wakes_waiter() {
        let p = SlidingPointer::new(0i64);
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| {
                p.wait(100);
                tx.send(p.get()).unwrap();
            });
            thread::sleep(Duration::from_millis(10));
            p.advance(50).unwrap();
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
            p.advance(100).unwrap();
            let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(seen >= 100);
        });
    }

    #[test]
    fn close_releases_every_waiter() {
        let p = SlidingPointer::new(0i64);
        thread::scope(|s| {
            let p = &p;
            let waiters: Vec<_> = (0..4)
                .map(|i| s.spawn(move || p.wait(1_000 * (i + 1))))
                .collect();
            thread::sleep(Duration::from_millis(10));
            p.close();
            for w in waiters {
                w.join().unwrap();
            }
        });
        assert!(p.is_closed());
        assert!(p.advance(1).is_err());
    }

    #[test]
    fn many_small_advances_do_not_lose_wakeups() {
        let p = SlidingPointer::new(0u64);
        thread::scope(|s| {
            s.spawn(|| {
                for target in 1..=10_000u64 {
                    p.wait(target);
                }
            });
            for v in 1..=10_000u64 {
                p.advance(v).unwrap();
            }
        });
    }
}
