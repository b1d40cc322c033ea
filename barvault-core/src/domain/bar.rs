//! Bar — one aggregated OHLCV observation.

use serde::{Deserialize, Serialize};

/// Aggregated price/volume observation for one time bucket.
///
/// `timestamp` is the bucket start in milliseconds since the Unix epoch (UTC).
/// Field order matches the column order of the record files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
    pub transactions: Option<u64>,
}
