//! Range chunker — splits a date range into bounded sub-intervals.
//!
//! Boundary policy is half-open calendar chunks `[start, next_start)`, stored as
//! inclusive dates (`end = next_start - 1 day`). Consecutive chunks therefore touch
//! without sharing a day. The first chunk starts at `from` even mid-period and the
//! last chunk is clipped to `to`.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use thiserror::Error;

/// Date format accepted on every input surface.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid date '{input}' (expected YYYY-MM-DD)")]
    InvalidDate { input: String },

    #[error("invalid chunk granularity '{0}' (expected month, week, year, whole, or <N>d)")]
    InvalidGranularity(String),
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(input: &str) -> Result<NaiveDate, ChunkError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).map_err(|_| ChunkError::InvalidDate {
        input: input.to_string(),
    })
}

/// Inclusive date interval with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    start: NaiveDate,
    end: NaiveDate,
}

impl Interval {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Chunk size for splitting a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Granularity {
    /// One chunk for the whole range.
    Whole,
    /// Fixed-length chunks of N days.
    Days(NonZeroU32),
    /// Calendar weeks, Monday to Sunday.
    Week,
    /// Calendar months.
    #[default]
    Month,
    /// Calendar years.
    Year,
}

impl Granularity {
    /// Start of the chunk after the one beginning at `start`.
    ///
    /// `None` means the next boundary is past chrono's representable range, so the
    /// current chunk runs to the end of the requested range.
    fn next_start(&self, start: NaiveDate) -> Option<NaiveDate> {
        match self {
            Granularity::Whole => None,
            Granularity::Days(n) => start.checked_add_days(Days::new(u64::from(n.get()))),
            Granularity::Week => {
                let to_monday = 7 - u64::from(start.weekday().num_days_from_monday());
                start.checked_add_days(Days::new(to_monday))
            }
            Granularity::Month => {
                if start.month() == 12 {
                    NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
                }
            }
            Granularity::Year => NaiveDate::from_ymd_opt(start.year() + 1, 1, 1),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Whole => f.write_str("whole"),
            Granularity::Days(n) => write!(f, "{n}d"),
            Granularity::Week => f.write_str("week"),
            Granularity::Month => f.write_str("month"),
            Granularity::Year => f.write_str("year"),
        }
    }
}

impl FromStr for Granularity {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "whole" | "none" => Ok(Granularity::Whole),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            "year" | "yearly" => Ok(Granularity::Year),
            other => other
                .strip_suffix('d')
                .and_then(|n| n.parse::<u32>().ok())
                .and_then(NonZeroU32::new)
                .map(Granularity::Days)
                .ok_or_else(|| ChunkError::InvalidGranularity(s.to_string())),
        }
    }
}

impl TryFrom<String> for Granularity {
    type Error = ChunkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Granularity> for String {
    fn from(value: Granularity) -> Self {
        value.to_string()
    }
}

/// Ordered, gap-free, non-overlapping chunks covering a date range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalPlan {
    chunks: Vec<Interval>,
}

impl IntervalPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Interval> {
        self.chunks.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.chunks.iter()
    }

}

impl<'a> IntoIterator for &'a IntervalPlan {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

/// Split `[from, to]` into chunks. `from > to` yields an empty plan.
pub fn plan(from: NaiveDate, to: NaiveDate, granularity: Granularity) -> IntervalPlan {
    let mut chunks = Vec::new();
    let mut cursor = from;

    while cursor <= to {
        let end = granularity
            .next_start(cursor)
            .and_then(|next| next.pred_opt())
            .map_or(to, |last_day| last_day.min(to));

        chunks.push(Interval { start: cursor, end });

        match end.succ_opt() {
            Some(next) if end < to => cursor = next,
            _ => break,
        }
    }

    IntervalPlan { chunks }
}
