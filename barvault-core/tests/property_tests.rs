//! Property tests for chunking and backoff invariants.
//!
//! Uses proptest to verify:
//! 1. Coverage: a plan covers [from, to] exactly, with no gaps and no overlaps
//! 2. Termination: an inverted range yields an empty plan
//! 3. Backoff growth: the pre-jitter delay strictly increases up to the ceiling
//! 4. Jitter band: jittered delays stay within ±jitter of the pre-jitter delay

use barvault_core::chunker::{plan, Granularity};
use barvault_core::{Backoff, BackoffPolicy, ErrorKind};
use chrono::{Days, NaiveDate};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::num::NonZeroU32;
use std::time::Duration;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    // 1990-01-01 .. roughly 2060
    (0u64..25_000).prop_map(|offset| {
        NaiveDate::from_ymd_opt(1990, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap()
    })
}

fn arb_granularity() -> impl Strategy<Value = Granularity> {
    prop_oneof![
        Just(Granularity::Whole),
        Just(Granularity::Week),
        Just(Granularity::Month),
        Just(Granularity::Year),
        (1u32..120).prop_map(|n| Granularity::Days(NonZeroU32::new(n).unwrap())),
    ]
}

fn arb_retryable() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![Just(ErrorKind::RateLimited), Just(ErrorKind::Transient)]
}

// ── 1/2. Chunker coverage ────────────────────────────────────────────

proptest! {
    #[test]
    fn plan_covers_range_without_gaps(
        a in arb_date(),
        span in 0u64..3_000,
        granularity in arb_granularity(),
    ) {
        let from = a;
        let to = a.checked_add_days(Days::new(span)).unwrap();
        let chunks: Vec<_> = plan(from, to, granularity).iter().copied().collect();

        prop_assert!(!chunks.is_empty());
        prop_assert_eq!(chunks[0].start(), from);
        prop_assert_eq!(chunks.last().unwrap().end(), to);

        for chunk in &chunks {
            prop_assert!(chunk.start() <= chunk.end());
        }
        for pair in chunks.windows(2) {
            // Next chunk starts the day after the previous one ends.
            prop_assert_eq!(pair[0].end().succ_opt().unwrap(), pair[1].start());
        }

        let covered: i64 = chunks
            .iter()
            .map(|c| (c.end() - c.start()).num_days() + 1)
            .sum();
        prop_assert_eq!(covered, span as i64 + 1);
    }

    #[test]
    fn inverted_range_is_empty(
        a in arb_date(),
        gap in 1u64..3_000,
        granularity in arb_granularity(),
    ) {
        let to = a;
        let from = a.checked_add_days(Days::new(gap)).unwrap();
        prop_assert!(plan(from, to, granularity).is_empty());
    }

    #[test]
    fn month_chunks_never_straddle_months(a in arb_date(), span in 0u64..1_500) {
        use chrono::Datelike;
        let to = a.checked_add_days(Days::new(span)).unwrap();
        for chunk in plan(a, to, Granularity::Month).iter() {
            prop_assert_eq!(chunk.start().month(), chunk.end().month());
            prop_assert_eq!(chunk.start().year(), chunk.end().year());
        }
    }
}

// ── 3/4. Backoff ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn base_delay_strictly_increases(
        base_ms in 1u64..60_000,
        max_retries in 1u32..10,
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms), max_retries, 0.2);
        for attempt in 1..max_retries {
            prop_assert!(policy.base_delay(attempt + 1) > policy.base_delay(attempt));
        }
    }

    #[test]
    fn gives_up_exactly_past_ceiling(
        kind in arb_retryable(),
        max_retries in 0u32..10,
        seed in any::<u64>(),
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(10), max_retries, 0.2);
        let mut rng = StdRng::seed_from_u64(seed);
        for attempt in 1..=max_retries {
            let retry = matches!(policy.next_delay(kind, attempt, &mut rng), Backoff::Retry(_));
            prop_assert!(retry);
        }
        prop_assert_eq!(
            policy.next_delay(kind, max_retries + 1, &mut rng),
            Backoff::GiveUp
        );
    }

    #[test]
    fn jitter_stays_within_band(
        base_ms in 1u64..60_000,
        jitter in 0.0..0.9_f64,
        attempt in 1u32..6,
        seed in any::<u64>(),
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms), 10, jitter);
        let mut rng = StdRng::seed_from_u64(seed);
        let base = policy.base_delay(attempt).as_secs_f64();

        match policy.next_delay(ErrorKind::Transient, attempt, &mut rng) {
            Backoff::Retry(delay) => {
                let d = delay.as_secs_f64();
                // Small epsilon for float rounding through Duration.
                let eps = 1e-6;
                prop_assert!(d >= base * (1.0 - jitter) - eps, "{} < lower bound", d);
                prop_assert!(d <= base * (1.0 + jitter) + eps, "{} > upper bound", d);
            }
            Backoff::GiveUp => prop_assert!(false, "attempt {} should retry", attempt),
        }
    }

    #[test]
    fn fatal_kinds_never_retry(attempt in 1u32..10, seed in any::<u64>()) {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(seed);
        prop_assert_eq!(policy.next_delay(ErrorKind::Malformed, attempt, &mut rng), Backoff::GiveUp);
        prop_assert_eq!(policy.next_delay(ErrorKind::Rejected, attempt, &mut rng), Backoff::GiveUp);
    }
}
