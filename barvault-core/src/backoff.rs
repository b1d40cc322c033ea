//! Backoff controller — retry decisions for failed page requests.
//!
//! Exponential growth from a base wait, doubling per attempt, with symmetric random
//! jitter so concurrently running fetches do not retry in lockstep. The controller
//! only computes durations; callers do the waiting.

use crate::fetch::{ErrorKind, FetchError};
use rand::Rng;
use std::time::Duration;

/// Largest retry ceiling with a strictly growing delay; the exponent stops at 31.
pub const MAX_RETRIES: u32 = 32;

/// Outcome of consulting the controller after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long, then retry the same request.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Retry policy shared by every page request of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max_retries: u32,
    jitter: f64,
}

impl Default for BackoffPolicy {
    /// 15s base, 5 retries, ±20% jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 5, 0.2)
    }
}

impl BackoffPolicy {
    /// `jitter` is clamped to `[0, 1)`.
    pub fn new(base: Duration, max_retries: u32, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.999)
        } else {
            0.0
        };
        Self {
            base,
            max_retries,
            jitter,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Pre-jitter delay for the given 1-based attempt: `base * 2^(attempt - 1)`.
    ///
    /// Flat past attempt [`MAX_RETRIES`].
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }

    /// Decide what to do after the `attempt`-th consecutive failure of one request.
    pub fn next_delay<R: Rng + ?Sized>(
        &self,
        kind: ErrorKind,
        attempt: u32,
        rng: &mut R,
    ) -> Backoff {
        if !kind.is_retryable() || attempt > self.max_retries {
            return Backoff::GiveUp;
        }

        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return Backoff::Retry(base);
        }

        let factor = 1.0 + self.jitter * rng.gen_range(-1.0..=1.0);
        let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base);
        Backoff::Retry(jittered)
    }

    /// Like [`next_delay`](Self::next_delay), honoring a server-provided `Retry-After` floor.
    pub fn delay_for<R: Rng + ?Sized>(
        &self,
        error: &FetchError,
        attempt: u32,
        rng: &mut R,
    ) -> Backoff {
        match self.next_delay(error.kind(), attempt, rng) {
            Backoff::Retry(delay) => {
                Backoff::Retry(error.retry_after().map_or(delay, |floor| delay.max(floor)))
            }
            Backoff::GiveUp => Backoff::GiveUp,
        }
    }
}

/// Retry bookkeeping for one page request.
///
/// Created when a page request starts, bumped on every retryable failure, and
/// dropped once the page succeeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchAttempt {
    pub failures: u32,
    pub last_error: Option<ErrorKind>,
    pub next_wait: Option<Duration>,
}

impl FetchAttempt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the controller's decision.
    pub fn record_failure<R: Rng + ?Sized>(
        &mut self,
        policy: &BackoffPolicy,
        error: &FetchError,
        rng: &mut R,
    ) -> Backoff {
        self.failures += 1;
        self.last_error = Some(error.kind());
        let decision = policy.delay_for(error, self.failures, rng);
        self.next_wait = match decision {
            Backoff::Retry(d) => Some(d),
            Backoff::GiveUp => None,
        };
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn base_delay_doubles() {
        let policy = BackoffPolicy::new(Duration::from_secs(15), 5, 0.2);
        assert_eq!(policy.base_delay(1), Duration::from_secs(15));
        assert_eq!(policy.base_delay(2), Duration::from_secs(30));
        assert_eq!(policy.base_delay(3), Duration::from_secs(60));
        assert_eq!(policy.base_delay(5), Duration::from_secs(240));
    }

    #[test]
    fn delay_keeps_growing_up_to_the_largest_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), MAX_RETRIES, 0.0);
        for attempt in 2..=MAX_RETRIES {
            assert!(policy.base_delay(attempt) > policy.base_delay(attempt - 1));
        }
    }

    #[test]
    fn gives_up_past_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), 3, 0.0);
        let mut rng = rng();
        for attempt in 1..=3 {
            assert!(matches!(
                policy.next_delay(ErrorKind::Transient, attempt, &mut rng),
                Backoff::Retry(_)
            ));
        }
        assert_eq!(
            policy.next_delay(ErrorKind::Transient, 4, &mut rng),
            Backoff::GiveUp
        );
    }

    #[test]
    fn never_retries_fatal_kinds() {
        let policy = BackoffPolicy::default();
        let mut rng = rng();
        assert_eq!(
            policy.next_delay(ErrorKind::Malformed, 1, &mut rng),
            Backoff::GiveUp
        );
        assert_eq!(
            policy.next_delay(ErrorKind::Rejected, 1, &mut rng),
            Backoff::GiveUp
        );
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), 5, 0.0);
        assert_eq!(
            policy.next_delay(ErrorKind::RateLimited, 3, &mut rng()),
            Backoff::Retry(Duration::from_secs(8))
        );
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = BackoffPolicy::new(Duration::from_secs(15), 5, 0.2);
        let mut rng = rng();
        for _ in 0..200 {
            match policy.next_delay(ErrorKind::Transient, 1, &mut rng) {
                Backoff::Retry(d) => {
                    assert!(d >= Duration::from_secs(12), "too short: {d:?}");
                    assert!(d <= Duration::from_secs(18), "too long: {d:?}");
                }
                Backoff::GiveUp => panic!("should retry"),
            }
        }
    }

    #[test]
    fn retry_after_is_a_floor() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 5, 0.0);
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(
            policy.delay_for(&err, 1, &mut rng()),
            Backoff::Retry(Duration::from_secs(60))
        );
    }

    #[test]
    fn jitter_is_clamped() {
        assert_eq!(BackoffPolicy::new(Duration::ZERO, 1, -3.0).jitter(), 0.0);
        assert!(BackoffPolicy::new(Duration::ZERO, 1, 5.0).jitter() < 1.0);
        assert_eq!(BackoffPolicy::new(Duration::ZERO, 1, f64::NAN).jitter(), 0.0);
    }

    #[test]
    fn attempt_tracks_failures() {
        let policy = BackoffPolicy::new(Duration::from_millis(5), 1, 0.0);
        let mut attempt = FetchAttempt::new();
        let err = FetchError::Transient("timeout".into());

        assert_eq!(
            attempt.record_failure(&policy, &err, &mut rng()),
            Backoff::Retry(Duration::from_millis(5))
        );
        assert_eq!(attempt.failures, 1);
        assert_eq!(attempt.next_wait, Some(Duration::from_millis(5)));

        assert_eq!(
            attempt.record_failure(&policy, &err, &mut rng()),
            Backoff::GiveUp
        );
        assert_eq!(attempt.failures, 2);
        assert_eq!(attempt.last_error, Some(ErrorKind::Transient));
        assert_eq!(attempt.next_wait, None);
    }
}
