//! Property tests for slot arithmetic and the interval set.

use proptest::prelude::*;
use sample_buffer::{BufferSettings, Ranges, SampleBuffer, offset_of};

const DOMAIN: u64 = 96;

#[derive(Debug, Clone)]
enum Op {
    Include(u64, u64),
    Exclude(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    (any::<bool>(), 0..=DOMAIN, 0..=DOMAIN).prop_map(|(include, a, b)| {
        let (begin, end) = (a.min(b), a.max(b));
        if include {
            Op::Include(begin, end)
        } else {
            Op::Exclude(begin, end)
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// offset(t) == offset(t + n) and 0 <= offset(t) < n
    #[test]
    fn offset_is_periodic_and_bounded(
        t in -1_000_000_000_000i64..1_000_000_000_000,
        n in 1u64..100_000,
    ) {
        let o = offset_of(t, n);
        prop_assert!((o as u64) < n);
        prop_assert_eq!(o, offset_of(t + n as i64, n));
        prop_assert_eq!(o, offset_of(t - n as i64, n));
    }

    /// Any include/exclude sequence agrees with a boolean-array oracle.
    #[test]
    fn ranges_match_oracle(ops in prop::collection::vec(op(), 0..40)) {
        let mut ranges = Ranges::new();
        let mut oracle = [false; DOMAIN as usize];

        for op in &ops {
            match *op {
                Op::Include(b, e) => {
                    ranges.include(b, e);
                    oracle[b as usize..e as usize].fill(true);
                }
                Op::Exclude(b, e) => {
                    ranges.exclude(b, e);
                    oracle[b as usize..e as usize].fill(false);
                }
            }
        }

        for x in 0..DOMAIN {
            prop_assert_eq!(ranges.contains(x), oracle[x as usize], "point {}", x);
        }

        // Intervals stay sorted, disjoint and non-adjacent.
        let intervals: Vec<_> = ranges.iter().collect();
        for pair in intervals.windows(2) {
            prop_assert!(pair[0].end < pair[1].start, "{:?}", intervals);
        }
        for r in &intervals {
            prop_assert!(r.start < r.end);
        }
    }

    /// covers/intersects agree with the oracle on arbitrary windows.
    #[test]
    fn range_queries_match_oracle(
        ops in prop::collection::vec(op(), 0..20),
        a in 0..=DOMAIN,
        b in 0..=DOMAIN,
    ) {
        let mut ranges = Ranges::new();
        let mut oracle = [false; DOMAIN as usize];
        for op in &ops {
            match *op {
                Op::Include(b, e) => {
                    ranges.include(b, e);
                    oracle[b as usize..e as usize].fill(true);
                }
                Op::Exclude(b, e) => {
                    ranges.exclude(b, e);
                    oracle[b as usize..e as usize].fill(false);
                }
            }
        }
        let (begin, end) = (a.min(b), a.max(b));
        let window = &oracle[begin as usize..end as usize];
        prop_assert_eq!(ranges.covers(begin, end), window.iter().all(|&v| v));
        prop_assert_eq!(ranges.intersects(begin, end), window.iter().any(|&v| v));
    }
}

#[test]
fn buffer_offset_agrees_with_offset_of() {
    let buffer = SampleBuffer::<u16, _>::local(BufferSettings::new(1, 1, 1000)).unwrap();
    for t in [-2_001i64, -1, 0, 1, 999, 1000, 123_456_789] {
        assert_eq!(buffer.offset(t), offset_of(t, 1000));
        assert_eq!(buffer.offset(t), buffer.offset(t + 1000));
    }
}
