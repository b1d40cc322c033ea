//! Batch runner — many independent runs on a bounded worker pool.
//!
//! Each (instrument, resolution) run owns its sink and its retry state; runs only
//! share the fetcher (and whatever request budget it paces through) and the
//! cancel token. A failed run never aborts its siblings.

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::fetch::PageFetcher;
use crate::orchestrator::{
    CompletionStatus, FailureKind, FetchOrchestrator, RetrievalResult, RunFailure, RunSpec,
};
use crate::sink::{RecordSink, SinkError};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Progress callbacks for a batch.
///
/// Called from worker threads; `index` is the job's position in the input.
pub trait BatchProgress: Send + Sync {
    fn on_start(&self, spec: &RunSpec, index: usize, total: usize);

    fn on_complete(&self, result: &RetrievalResult, finished: usize, total: usize);

    fn on_batch_complete(&self, summary: &BatchSummary);
}

/// Progress reporter that emits `tracing` events.
pub struct LogProgress;

impl BatchProgress for LogProgress {
    fn on_start(&self, spec: &RunSpec, index: usize, total: usize) {
        info!(
            ticker = %spec.instrument,
            resolution = %spec.resolution,
            "[{}/{}] fetching",
            index + 1,
            total
        );
    }

    fn on_complete(&self, result: &RetrievalResult, finished: usize, total: usize) {
        match &result.status {
            CompletionStatus::Failed(failure) => warn!(
                ticker = %result.instrument,
                resolution = %result.resolution,
                "[{finished}/{total}] failed: {failure}"
            ),
            _ => info!(
                ticker = %result.instrument,
                resolution = %result.resolution,
                records = result.records_written,
                "[{finished}/{total}] done"
            ),
        }
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        info!(
            succeeded = summary.succeeded,
            no_data = summary.no_data,
            failed = summary.failed,
            total = summary.total,
            "batch finished"
        );
    }
}

/// Results of a batch, in input order.
#[derive(Debug)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub no_data: usize,
    pub failed: usize,
    pub results: Vec<RetrievalResult>,
}

impl BatchSummary {
    fn from_results(results: Vec<RetrievalResult>) -> Self {
        let mut summary = Self {
            total: results.len(),
            succeeded: 0,
            no_data: 0,
            failed: 0,
            results: Vec::new(),
        };
        for result in &results {
            match result.status {
                CompletionStatus::Complete => summary.succeeded += 1,
                CompletionStatus::PartialNoData => summary.no_data += 1,
                CompletionStatus::Failed(_) => summary.failed += 1,
            }
        }
        summary.results = results;
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &RetrievalResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Shared settings for every run of a batch.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub policy: BackoffPolicy,
    pub concurrency: usize,
    pub cancel: CancelToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            concurrency: 3,
            cancel: CancelToken::new(),
        }
    }
}

/// Run every spec on a pool of `options.concurrency` workers.
///
/// `open_sink` is called on the worker right before its run starts. A sink that
/// cannot be opened fails that run only.
pub fn run_batch<F, S, O>(
    fetcher: &F,
    specs: &[RunSpec],
    options: &BatchOptions,
    open_sink: O,
    progress: &dyn BatchProgress,
) -> Result<BatchSummary, BatchError>
where
    F: PageFetcher,
    S: RecordSink,
    O: Fn(&RunSpec) -> Result<S, SinkError> + Sync,
{
    if options.concurrency == 0 {
        return Err(BatchError::ZeroConcurrency);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency)
        .thread_name(|i| format!("barvault-worker-{i}"))
        .build()?;

    let total = specs.len();
    let finished = AtomicUsize::new(0);

    let results: Vec<RetrievalResult> = pool.install(|| {
        specs
            .par_iter()
            .enumerate()
            .map(|(index, spec)| {
                progress.on_start(spec, index, total);
                let result = match open_sink(spec) {
                    Ok(sink) => FetchOrchestrator::new(fetcher, options.policy)
                        .with_cancel(options.cancel.clone())
                        .run(spec, sink),
                    Err(e) => unopened(spec, e),
                };
                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                progress.on_complete(&result, done, total);
                result
            })
            .collect()
    });

    let summary = BatchSummary::from_results(results);
    progress.on_batch_complete(&summary);
    Ok(summary)
}

fn unopened(spec: &RunSpec, err: SinkError) -> RetrievalResult {
    RetrievalResult {
        instrument: spec.instrument.clone(),
        resolution: spec.resolution,
        records_written: 0,
        destination: err.path().to_path_buf(),
        status: CompletionStatus::Failed(RunFailure {
            interval: None,
            kind: FailureKind::Sink,
            message: err.to_string(),
        }),
        pages_fetched: 0,
        retries: 0,
        duplicates_dropped: 0,
    }
}
