//! Bar resolution: a timespan unit plus an integer multiplier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use thiserror::Error;

/// Unit of a bar bucket, named as the aggregates endpoint names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Timespan {
    /// Path segment used by the upstream API (`minute`, `hour`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timespan::Second => "second",
            Timespan::Minute => "minute",
            Timespan::Hour => "hour",
            Timespan::Day => "day",
            Timespan::Week => "week",
            Timespan::Month => "month",
            Timespan::Quarter => "quarter",
            Timespan::Year => "year",
        }
    }

    /// Short label used in timeframe tags (`1min`, `1hour`, `1day`).
    pub fn short(&self) -> &'static str {
        match self {
            Timespan::Second => "sec",
            Timespan::Minute => "min",
            other => other.as_str(),
        }
    }

    fn parse_unit(s: &str) -> Option<Self> {
        let unit = match s {
            "s" | "sec" | "second" | "seconds" => Timespan::Second,
            "min" | "minute" | "minutes" => Timespan::Minute,
            "h" | "hour" | "hours" => Timespan::Hour,
            "d" | "day" | "days" => Timespan::Day,
            "w" | "week" | "weeks" => Timespan::Week,
            "mo" | "month" | "months" => Timespan::Month,
            "q" | "quarter" | "quarters" => Timespan::Quarter,
            "y" | "year" | "years" => Timespan::Year,
            _ => return None,
        };
        Some(unit)
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("invalid resolution '{0}' (expected e.g. 1minute, 5min, 1hour, 1day)")]
    Invalid(String),

    #[error("resolution multiplier must be at least 1: '{0}'")]
    ZeroMultiplier(String),
}

/// Bar bucket size, e.g. 1×minute or 5×minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub multiplier: NonZeroU32,
    pub timespan: Timespan,
}

impl Resolution {
    pub fn new(multiplier: NonZeroU32, timespan: Timespan) -> Self {
        Self {
            multiplier,
            timespan,
        }
    }

    /// 1×`timespan`.
    pub fn one(timespan: Timespan) -> Self {
        Self::new(NonZeroU32::MIN, timespan)
    }

    /// Timeframe tag: `1min`, `1hour`, `5min`, `1day`.
    pub fn label(&self) -> String {
        format!("{}{}", self.multiplier, self.timespan.short())
    }

    /// File-name fragment: `minute` for 1×minute, `5minute` otherwise.
    pub fn file_fragment(&self) -> String {
        if self.multiplier.get() == 1 {
            self.timespan.as_str().to_string()
        } else {
            format!("{}{}", self.multiplier, self.timespan.as_str())
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.multiplier, self.timespan)
    }
}

impl FromStr for Resolution {
    type Err = ResolutionError;

    /// Parses `minute`, `1minute`, `5min`, `1hour`, `1day`, `2w` ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ResolutionError::Invalid(s.to_string()))?;
        let (digits, unit) = trimmed.split_at(split);

        let multiplier = if digits.is_empty() {
            NonZeroU32::MIN
        } else {
            let n: u32 = digits
                .parse()
                .map_err(|_| ResolutionError::Invalid(s.to_string()))?;
            NonZeroU32::new(n).ok_or_else(|| ResolutionError::ZeroMultiplier(s.to_string()))?
        };

        let timespan =
            Timespan::parse_unit(unit).ok_or_else(|| ResolutionError::Invalid(s.to_string()))?;
        Ok(Self::new(multiplier, timespan))
    }
}
