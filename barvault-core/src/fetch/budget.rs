//! Client-side request pacing shared by every run in a batch.
//!
//! Upstream free tiers allow a fixed number of calls per minute across all
//! concurrent fetches. The budget hands out evenly spaced request slots; a caller
//! that asks for a slot is told how long to wait before using it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Evenly spaced request slots, `requests_per_minute` per minute.
#[derive(Debug)]
pub struct RequestBudget {
    interval: Duration,
    next_free: Mutex<Option<Instant>>,
}

impl RequestBudget {
    /// Returns `None` when `requests_per_minute` is zero (unlimited).
    pub fn per_minute(requests_per_minute: u32) -> Option<Self> {
        if requests_per_minute == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(60) / requests_per_minute,
            next_free: Mutex::new(None),
        })
    }

    /// Minimum spacing between two requests.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Claim the next slot and return how long to wait before sending.
    pub fn reserve(&self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&self, now: Instant) -> Duration {
        let mut next_free = self
            .next_free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = match *next_free {
            Some(free) if free > now => free,
            _ => now,
        };
        *next_free = Some(slot + self.interval);
        slot - now
    }
}
