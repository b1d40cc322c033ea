//! Page-level request and response types exchanged with a fetcher.

use crate::chunker::Interval;
use crate::domain::{Bar, Resolution};
use std::fmt;

/// One sub-interval query for one instrument at one resolution.
///
/// Immutable once built; the interval guarantees `start <= end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    instrument: String,
    resolution: Resolution,
    interval: Interval,
}

impl FetchRequest {
    pub fn new(instrument: impl Into<String>, resolution: Resolution, interval: Interval) -> Self {
        Self {
            instrument: instrument.into(),
            resolution,
            interval,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.instrument, self.resolution, self.interval
        )
    }
}

/// Opaque continuation cursor handed back by a paginated endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded page: bars in ascending timestamp order plus an optional cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub bars: Vec<Bar>,
    pub next: Option<PageToken>,
}

impl Page {
    pub fn new(bars: Vec<Bar>, next: Option<PageToken>) -> Self {
        Self { bars, next }
    }

    /// No records and no continuation: the interval is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.bars.is_empty() && self.next.is_none()
    }

    /// Index of the first bar whose timestamp is lower than its predecessor's.
    pub fn first_out_of_order(&self) -> Option<usize> {
        self.bars
            .windows(2)
            .position(|w| w[1].timestamp < w[0].timestamp)
            .map(|i| i + 1)
    }
}
