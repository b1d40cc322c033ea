//! barvault CLI — backfill historical bars, archive them, inspect record files.

mod archive;

use anyhow::{bail, Context, Result};
use archive::{object_key, object_tags, Archiver, DirectoryArchiver};
use barvault_core::chunker::parse_date;
use barvault_core::fetch::{MetadataLookup, PolygonReference};
use barvault_core::{
    record_file_name, run_batch, summarize, BatchOptions, CancelToken, CompletionStatus, CsvSink,
    FetchConfig, Granularity, LogProgress, PageFetcher, PolygonFetcher, RequestBudget,
    Resolution, RetrievalResult, RunSpec,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgAction, Parser, Subcommand};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
#[command(
    name = "barvault",
    version,
    about = "barvault — paginated historical bar backfill"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch bars for every ticker × resolution into CSV record files.
    Fetch(FetchArgs),
    /// Summarize existing record files (rows, first/last timestamp, frequency).
    Inspect {
        /// Record files to summarize.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(clap::Args)]
struct FetchArgs {
    /// Tickers to fetch (space- or comma-separated).
    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ',',
        required_unless_present = "tickers_file"
    )]
    tickers: Vec<String>,

    /// CSV file with a `ticker` column.
    #[arg(long, conflicts_with = "tickers")]
    tickers_file: Option<PathBuf>,

    /// Start date (YYYY-MM-DD), inclusive.
    #[arg(long)]
    from: String,

    /// End date (YYYY-MM-DD), inclusive.
    #[arg(long)]
    to: String,

    /// Bar resolutions to fetch.
    #[arg(long, value_delimiter = ',', default_value = "1minute,1hour,1day")]
    resolutions: Vec<String>,

    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// API key. Falls back to the variable named by `api.api_key_env`.
    #[arg(long, env = "POLYGON_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory for record files.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Archive completed files under this directory.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Source name used in archive keys and tags. Defaults to the fetcher's name.
    #[arg(long)]
    source: Option<String>,

    /// Chunk granularity override (month, week, year, whole, Nd).
    #[arg(long)]
    granularity: Option<Granularity>,

    /// Continue existing record files instead of overwriting them.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Concurrent runs override.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Cancel all runs after this many seconds.
    #[arg(long)]
    max_runtime_secs: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Fetch(args) => run_fetch(args),
        Commands::Inspect { files } => run_inspect(&files),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[derive(Deserialize)]
struct TickerRow {
    ticker: String,
}

/// Parse `--from`/`--to`. An inverted range is refused before any file is touched.
fn parse_range(from: &str, to: &str) -> Result<(NaiveDate, NaiveDate)> {
    let from = parse_date(from)?;
    let to = parse_date(to)?;
    if from > to {
        bail!("start date {from} is after end date {to}");
    }
    Ok((from, to))
}

fn load_tickers(args: &FetchArgs) -> Result<Vec<String>> {
    let mut tickers: Vec<String> = match &args.tickers_file {
        Some(path) => {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("open tickers file {}", path.display()))?;
            reader
                .deserialize::<TickerRow>()
                .map(|row| row.map(|r| r.ticker))
                .collect::<std::result::Result<_, _>>()
                .with_context(|| format!("read `ticker` column from {}", path.display()))?
        }
        None => args.tickers.clone(),
    };

    let mut seen = HashSet::new();
    tickers = tickers
        .into_iter()
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect();
    if tickers.is_empty() {
        bail!("no tickers given");
    }
    Ok(tickers)
}

fn run_fetch(args: FetchArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => FetchConfig::from_file(path)?,
        None => FetchConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.batch.concurrency = concurrency;
    }
    if let Some(granularity) = args.granularity {
        config.chunking.granularity = granularity;
    }
    config.validate()?;
    if let Ok(text) = config.to_toml() {
        debug!("effective config:\n{text}");
    }

    let tickers = load_tickers(&args)?;
    let resolutions = args
        .resolutions
        .iter()
        .map(|r| r.parse::<Resolution>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let (from, to) = parse_range(&args.from, &args.to)?;

    let api_key = match &args.api_key {
        Some(key) => key.clone(),
        None => config.api_key()?,
    };

    let cancel = CancelToken::new();
    let mut fetcher = PolygonFetcher::new(
        &config.api.base_url,
        &api_key,
        config.timeout(),
        config.api.page_limit,
    )
    .context("build HTTP client")?
    .with_cancel(cancel.clone());
    if let Some(budget) = RequestBudget::per_minute(config.api.requests_per_minute) {
        info!(
            per_minute = config.api.requests_per_minute,
            spacing_ms = budget.interval().as_millis() as u64,
            "pacing requests"
        );
        fetcher = fetcher.with_budget(Arc::new(budget));
    }

    let granularity = config.chunking.granularity;
    let specs: Vec<RunSpec> = tickers
        .iter()
        .flat_map(|ticker| {
            resolutions.iter().map(move |&resolution| {
                RunSpec::new(ticker.clone(), resolution, from, to)
                    .with_granularity(granularity)
            })
        })
        .collect();

    if let Some(secs) = args.max_runtime_secs {
        let watchdog = cancel.clone();
        thread::spawn(move || {
            if watchdog.wait(Duration::from_secs(secs)) {
                warn!(secs, "maximum runtime reached, cancelling remaining work");
                watchdog.cancel();
            }
        });
    }

    let options = BatchOptions {
        policy: config.backoff_policy(),
        concurrency: config.batch.concurrency,
        cancel: cancel.clone(),
    };
    debug!(
        base_ms = options.policy.base().as_millis() as u64,
        max_retries = options.policy.max_retries(),
        jitter = options.policy.jitter(),
        "retry policy"
    );
    let output_dir = args.output_dir.clone();
    let resume = args.resume;

    let summary = run_batch(
        &fetcher,
        &specs,
        &options,
        |spec| {
            let path = output_dir.join(record_file_name(&spec.instrument, spec.resolution));
            if resume {
                CsvSink::resume(path)
            } else {
                CsvSink::create(path)
            }
        },
        &LogProgress,
    )?;

    print_results(&summary.results);

    let mut archive_failures = 0;
    if let Some(root) = &args.archive_dir {
        let reference = PolygonReference::new(&config.api.base_url, &api_key, config.timeout())
            .context("build reference client")?;
        let source = args.source.as_deref().unwrap_or_else(|| fetcher.name());
        archive_failures = archive_results(
            &summary.results,
            &DirectoryArchiver::new(root),
            &reference,
            source,
        );
    }

    println!(
        "\n{} complete, {} without data, {} failed, {} archive failures",
        summary.succeeded, summary.no_data, summary.failed, archive_failures
    );

    if !summary.all_succeeded() || archive_failures > 0 {
        for result in summary.failures() {
            if let CompletionStatus::Failed(failure) = &result.status {
                eprintln!(
                    "Error for {} {}: {failure}",
                    result.instrument,
                    result.resolution.label()
                );
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn print_results(results: &[RetrievalResult]) {
    println!(
        "\n{:<10} {:<8} {:<14} {:>10} {:>7} {:>7} {:>6}  {}",
        "TICKER", "RES", "STATUS", "RECORDS", "PAGES", "RETRY", "DUPES", "FILE"
    );
    for r in results {
        let status = match &r.status {
            CompletionStatus::Complete => "complete".to_string(),
            CompletionStatus::PartialNoData => "no data".to_string(),
            CompletionStatus::Failed(f) => format!("failed ({})", short_kind(f.kind)),
        };
        println!(
            "{:<10} {:<8} {:<14} {:>10} {:>7} {:>7} {:>6}  {}",
            r.instrument,
            r.resolution.label(),
            status,
            r.records_written,
            r.pages_fetched,
            r.retries,
            r.duplicates_dropped,
            r.destination.display()
        );
    }
}

fn short_kind(kind: barvault_core::FailureKind) -> &'static str {
    use barvault_core::FailureKind::*;
    match kind {
        Malformed => "malformed",
        Rejected => "rejected",
        RetryCeilingExceeded { .. } => "retries",
        Cancelled => "cancelled",
        Sink => "sink",
    }
}

/// Archive every completed file. Returns the number of files that failed.
fn archive_results(
    results: &[RetrievalResult],
    archiver: &dyn Archiver,
    reference: &dyn MetadataLookup,
    source: &str,
) -> usize {
    let now = Utc::now();
    let mut metadata = HashMap::new();
    let mut failures = 0;

    for result in results {
        if result.status != CompletionStatus::Complete {
            continue;
        }
        let meta = metadata
            .entry(result.instrument.clone())
            .or_insert_with(|| reference.lookup(&result.instrument));
        let timeframe = result.resolution.label();
        let key = object_key(meta, &result.instrument, source, &timeframe, now);
        let tags = object_tags(meta, &result.instrument, source, &timeframe, "raw");

        match archiver.archive(&result.destination, &key, &tags) {
            Ok(target) => info!(
                ticker = %result.instrument,
                key = %key,
                target = %target.display(),
                "archived"
            ),
            Err(e) => {
                warn!(ticker = %result.instrument, error = %format!("{e:#}"), "archive failed");
                failures += 1;
            }
        }
    }
    failures
}

fn run_inspect(files: &[PathBuf]) -> Result<()> {
    println!(
        "{:<40} {:>10} {:<26} {:<26} {:<8}",
        "FILE", "ROWS", "FIRST", "LAST", "FREQ"
    );
    for file in files {
        let summary = summarize(file).with_context(|| format!("inspect {}", file.display()))?;
        println!(
            "{:<40} {:>10} {:<26} {:<26} {:<8}",
            display_name(file),
            summary.rows,
            format_ts(summary.first_timestamp),
            format_ts(summary.last_timestamp),
            summary
                .frequency
                .map_or_else(|| "unknown".to_string(), |f| f.to_string())
        );
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
