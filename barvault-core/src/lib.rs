//! barvault core — historical market-bar backfill pipeline.
//!
//! Turns a date range and a bar resolution into one ordered, deduplicated record
//! file per instrument, against an upstream API that paginates, throttles, and
//! fails transiently:
//! - Range chunking into calendar sub-intervals
//! - Page fetching with continuation cursors
//! - Exponential backoff with jitter and a retry ceiling
//! - A per-run state machine that never skips or duplicates a page
//! - Append-only CSV sinks that survive interruption and can be resumed
//! - A bounded worker pool for many runs at once

pub mod backoff;
pub mod batch;
pub mod cancel;
pub mod chunker;
pub mod config;
pub mod domain;
pub mod fetch;
pub mod orchestrator;
pub mod sink;

pub use backoff::{Backoff, BackoffPolicy, FetchAttempt, MAX_RETRIES};
pub use batch::{run_batch, BatchError, BatchOptions, BatchProgress, BatchSummary, LogProgress};
pub use cancel::CancelToken;
pub use chunker::{plan, ChunkError, Granularity, Interval, IntervalPlan};
pub use config::{ConfigError, FetchConfig};
pub use domain::{Bar, FetchRequest, Page, PageToken, Resolution, Timespan};
pub use fetch::{ErrorKind, FetchError, PageFetcher, PolygonFetcher, RequestBudget};
pub use orchestrator::{
    CompletionStatus, FailureKind, FetchOrchestrator, RetrievalResult, RunFailure, RunSpec,
};
pub use sink::{record_file_name, summarize, CsvSink, FileSummary, RecordSink, SinkError};
