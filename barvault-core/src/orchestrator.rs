//! Fetch orchestrator — drives one (instrument, resolution) run end to end.
//!
//! A run walks the interval plan in order and, inside each interval, follows
//! continuation cursors page by page. Failed pages are retried with the same
//! cursor after a backoff wait; accepted pages go straight to the sink. The sink
//! is finalized on every terminal state so partial output is always flushed.

use crate::backoff::{Backoff, BackoffPolicy, FetchAttempt};
use crate::cancel::CancelToken;
use crate::chunker::{self, Granularity, Interval, IntervalPlan};
use crate::domain::{Bar, FetchRequest, PageToken, Resolution};
use crate::fetch::{ErrorKind, FetchError, PageFetcher};
use crate::sink::RecordSink;
use chrono::{DateTime, NaiveDate};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// What one run should retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub instrument: String,
    pub resolution: Resolution,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub granularity: Granularity,
}

impl RunSpec {
    pub fn new(
        instrument: impl Into<String>,
        resolution: Resolution,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            resolution,
            from,
            to,
            granularity: Granularity::default(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Interval plan, starting no earlier than the day before `resume_after`.
    ///
    /// Restarting one day early re-requests the boundary bucket; the dedupe
    /// watermark drops whatever was already written.
    pub fn plan(&self, resume_after: Option<i64>) -> IntervalPlan {
        let from = resume_after
            .and_then(DateTime::from_timestamp_millis)
            .and_then(|dt| dt.date_naive().pred_opt())
            .map_or(self.from, |resume| resume.max(self.from));
        chunker::plan(from, self.to, self.granularity)
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Malformed,
    Rejected,
    RetryCeilingExceeded { last: ErrorKind },
    Cancelled,
    Sink,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Malformed => f.write_str("malformed response"),
            FailureKind::Rejected => f.write_str("rejected"),
            FailureKind::RetryCeilingExceeded { last } => {
                write!(f, "retry ceiling exceeded (last: {last})")
            }
            FailureKind::Cancelled => f.write_str("cancelled"),
            FailureKind::Sink => f.write_str("sink error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    /// Sub-interval in progress when the run stopped.
    pub interval: Option<Interval>,
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    fn new(interval: Option<Interval>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            interval,
            kind,
            message: message.into(),
        }
    }

    fn from_fetch(interval: Interval, err: &FetchError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Malformed => FailureKind::Malformed,
            ErrorKind::Rejected => FailureKind::Rejected,
            ErrorKind::Cancelled => FailureKind::Cancelled,
            last => FailureKind::RetryCeilingExceeded { last },
        };
        Self::new(Some(interval), kind, err.to_string())
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(interval) => write!(f, "{} in {interval}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Every interval was exhausted and the destination holds records.
    Complete,
    /// Every interval was exhausted but upstream had no records at all.
    PartialNoData,
    Failed(RunFailure),
}

impl CompletionStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, CompletionStatus::Failed(_))
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub instrument: String,
    pub resolution: Resolution,
    /// Records in the destination after finalization, including resumed ones.
    pub records_written: u64,
    pub destination: PathBuf,
    pub status: CompletionStatus,
    pub pages_fetched: u64,
    pub retries: u64,
    pub duplicates_dropped: u64,
}

impl RetrievalResult {
    pub fn is_success(&self) -> bool {
        !self.status.is_failed()
    }
}

enum RunState {
    Idle,
    FetchingInterval {
        index: usize,
    },
    FetchingPage {
        index: usize,
        request: FetchRequest,
        token: Option<PageToken>,
        /// Cursors already handed out within this interval.
        seen: HashSet<PageToken>,
        attempt: FetchAttempt,
    },
    Completed,
    Failed(RunFailure),
}

#[derive(Default)]
struct RunCounters {
    pages: u64,
    retries: u64,
    duplicates: u64,
}

/// Drives runs against one fetcher with one retry policy.
pub struct FetchOrchestrator<F> {
    fetcher: F,
    policy: BackoffPolicy,
    cancel: CancelToken,
    rng: StdRng,
}

impl<F: PageFetcher> FetchOrchestrator<F> {
    pub fn new(fetcher: F, policy: BackoffPolicy) -> Self {
        Self {
            fetcher,
            policy,
            cancel: CancelToken::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fix the jitter source, for reproducible delays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Retrieve `spec` into `sink`.
    ///
    /// If the sink already holds records, the plan restarts near its last
    /// timestamp and anything at or before that timestamp is dropped.
    pub fn run<S: RecordSink>(&mut self, spec: &RunSpec, mut sink: S) -> RetrievalResult {
        let mut watermark = sink.last_timestamp();
        let plan = spec.plan(watermark);
        let mut counters = RunCounters::default();
        let mut state = RunState::Idle;

        let outcome = loop {
            state = match state {
                RunState::Idle => {
                    info!(
                        ticker = %spec.instrument,
                        resolution = %spec.resolution,
                        source = self.fetcher.name(),
                        chunks = plan.len(),
                        resumed_records = sink.written(),
                        "starting run"
                    );
                    RunState::FetchingInterval { index: 0 }
                }

                RunState::FetchingInterval { index } => match plan.get(index) {
                    None => RunState::Completed,
                    Some(&interval) => {
                        debug!(
                            ticker = %spec.instrument,
                            %interval,
                            chunk = index + 1,
                            of = plan.len(),
                            "fetching interval"
                        );
                        RunState::FetchingPage {
                            index,
                            request: FetchRequest::new(
                                spec.instrument.clone(),
                                spec.resolution,
                                interval,
                            ),
                            token: None,
                            seen: HashSet::new(),
                            attempt: FetchAttempt::new(),
                        }
                    }
                },

                RunState::FetchingPage {
                    index,
                    request,
                    token,
                    seen,
                    attempt,
                } => self.fetch_page(
                    index,
                    request,
                    token,
                    seen,
                    attempt,
                    &mut sink,
                    &mut watermark,
                    &mut counters,
                ),

                RunState::Completed => break Ok(()),
                RunState::Failed(failure) => break Err(failure),
            };
        };

        self.finish(spec, sink, outcome, counters)
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_page<S: RecordSink>(
        &mut self,
        index: usize,
        request: FetchRequest,
        token: Option<PageToken>,
        mut seen: HashSet<PageToken>,
        mut attempt: FetchAttempt,
        sink: &mut S,
        watermark: &mut Option<i64>,
        counters: &mut RunCounters,
    ) -> RunState {
        let interval = request.interval();
        if self.cancel.is_cancelled() {
            return RunState::Failed(RunFailure::new(
                Some(interval),
                FailureKind::Cancelled,
                "cancelled before page request",
            ));
        }

        match self.fetcher.fetch(&request, token.as_ref()) {
            Ok(page) => {
                counters.pages += 1;

                if page.is_exhausted() {
                    debug!(ticker = request.instrument(), %interval, "interval exhausted");
                    return RunState::FetchingInterval { index: index + 1 };
                }

                if let Some(i) = page.first_out_of_order() {
                    return RunState::Failed(RunFailure::new(
                        Some(interval),
                        FailureKind::Malformed,
                        format!("bars out of order at index {i}"),
                    ));
                }
                if let Some(next) = &page.next {
                    if !seen.insert(next.clone()) {
                        return RunState::Failed(RunFailure::new(
                            Some(interval),
                            FailureKind::Malformed,
                            format!("upstream repeated continuation cursor {next}"),
                        ));
                    }
                }

                let fresh = drop_seen(page.bars, *watermark);
                counters.duplicates += fresh.dropped;
                if let Err(e) = sink.append(&fresh.bars) {
                    return RunState::Failed(RunFailure::new(
                        Some(interval),
                        FailureKind::Sink,
                        e.to_string(),
                    ));
                }
                if let Some(last) = fresh.bars.last() {
                    *watermark = Some(last.timestamp);
                }

                debug!(
                    ticker = request.instrument(),
                    %interval,
                    appended = fresh.bars.len(),
                    dropped = fresh.dropped,
                    total = sink.written(),
                    "page accepted"
                );

                match page.next {
                    Some(next) => RunState::FetchingPage {
                        index,
                        request,
                        token: Some(next),
                        seen,
                        attempt: FetchAttempt::new(),
                    },
                    None => RunState::FetchingInterval { index: index + 1 },
                }
            }

            Err(err) => match attempt.record_failure(&self.policy, &err, &mut self.rng) {
                Backoff::Retry(delay) => {
                    counters.retries += 1;
                    warn!(
                        ticker = request.instrument(),
                        %interval,
                        attempt = attempt.failures,
                        ceiling = self.policy.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "page request failed, backing off"
                    );
                    if !self.cancel.wait(delay) {
                        return RunState::Failed(RunFailure::new(
                            Some(interval),
                            FailureKind::Cancelled,
                            "cancelled during backoff",
                        ));
                    }
                    RunState::FetchingPage {
                        index,
                        request,
                        token,
                        seen,
                        attempt,
                    }
                }
                Backoff::GiveUp => {
                    RunState::Failed(RunFailure::from_fetch(interval, &err))
                }
            },
        }
    }

    fn finish<S: RecordSink>(
        &self,
        spec: &RunSpec,
        sink: S,
        outcome: Result<(), RunFailure>,
        counters: RunCounters,
    ) -> RetrievalResult {
        let destination = sink.destination().to_path_buf();
        let written_before_close = sink.written();

        let (records_written, status) = match (sink.finalize(), outcome) {
            (Ok(total), Ok(())) if total == 0 => (0, CompletionStatus::PartialNoData),
            (Ok(total), Ok(())) => (total, CompletionStatus::Complete),
            (Ok(total), Err(failure)) => (total, CompletionStatus::Failed(failure)),
            (Err(e), Ok(())) => (
                written_before_close,
                CompletionStatus::Failed(RunFailure::new(None, FailureKind::Sink, e.to_string())),
            ),
            (Err(e), Err(failure)) => {
                warn!(ticker = %spec.instrument, error = %e, "failed to finalize sink");
                (written_before_close, CompletionStatus::Failed(failure))
            }
        };

        match &status {
            CompletionStatus::Complete => info!(
                ticker = %spec.instrument,
                resolution = %spec.resolution,
                records = records_written,
                pages = counters.pages,
                retries = counters.retries,
                destination = %destination.display(),
                "run complete"
            ),
            CompletionStatus::PartialNoData => warn!(
                ticker = %spec.instrument,
                resolution = %spec.resolution,
                pages = counters.pages,
                "run finished without any records"
            ),
            CompletionStatus::Failed(failure) => error!(
                ticker = %spec.instrument,
                resolution = %spec.resolution,
                records = records_written,
                error = %failure,
                "run failed"
            ),
        }

        RetrievalResult {
            instrument: spec.instrument.clone(),
            resolution: spec.resolution,
            records_written,
            destination,
            status,
            pages_fetched: counters.pages,
            retries: counters.retries,
            duplicates_dropped: counters.duplicates,
        }
    }
}

struct Fresh {
    bars: Vec<Bar>,
    dropped: u64,
}

/// Keep only bars strictly after the watermark. Input must be ascending.
fn drop_seen(bars: Vec<Bar>, watermark: Option<i64>) -> Fresh {
    let Some(mark) = watermark else {
        return Fresh { bars, dropped: 0 };
    };
    let skip = bars.partition_point(|b| b.timestamp <= mark);
    let bars = bars.into_iter().skip(skip).collect();
    Fresh {
        bars,
        dropped: skip as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::parse_date;
    use crate::domain::Timespan;

    fn bar(ts: i64) -> Bar {
        Bar {
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            vwap: None,
            transactions: None,
        }
    }

    #[test]
    fn drop_seen_without_watermark_keeps_everything() {
        let fresh = drop_seen(vec![bar(1), bar(2)], None);
        assert_eq!(fresh.bars.len(), 2);
        assert_eq!(fresh.dropped, 0);
    }

    #[test]
    fn drop_seen_drops_at_and_before_watermark() {
        let fresh = drop_seen(vec![bar(1), bar(2), bar(3), bar(4)], Some(2));
        let ts: Vec<i64> = fresh.bars.iter().map(|b| b.timestamp).collect();
        assert_eq!(ts, vec![3, 4]);
        assert_eq!(fresh.dropped, 2);
    }

    #[test]
    fn resume_starts_a_day_before_last_record() {
        let spec = RunSpec::new(
            "X",
            Resolution::one(Timespan::Day),
            parse_date("2023-01-01").unwrap(),
            parse_date("2023-03-31").unwrap(),
        );
        // 2023-02-10T00:00:00Z
        let plan = spec.plan(Some(1_675_987_200_000));
        assert_eq!(plan.get(0).unwrap().start(), parse_date("2023-02-09").unwrap());
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn resume_never_starts_before_from() {
        let spec = RunSpec::new(
            "X",
            Resolution::one(Timespan::Day),
            parse_date("2023-01-01").unwrap(),
            parse_date("2023-01-31").unwrap(),
        );
        // 2022-12-01
        let plan = spec.plan(Some(1_669_852_800_000));
        assert_eq!(plan.get(0).unwrap().start(), parse_date("2023-01-01").unwrap());
    }

    #[test]
    fn failure_kinds_map_from_fetch_errors() {
        let iv = Interval::new(
            parse_date("2023-01-01").unwrap(),
            parse_date("2023-01-31").unwrap(),
        )
        .unwrap();
        let f = RunFailure::from_fetch(iv, &FetchError::Malformed("x".into()));
        assert_eq!(f.kind, FailureKind::Malformed);
        let f = RunFailure::from_fetch(iv, &FetchError::Transient("x".into()));
        assert_eq!(
            f.kind,
            FailureKind::RetryCeilingExceeded {
                last: ErrorKind::Transient
            }
        );
        assert!(f.to_string().contains("2023-01-01"));
    }
}
