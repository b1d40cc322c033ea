//! Record sinks — incremental, ordered, single-header output.
//!
//! A sink is owned by exactly one run. Every append is flushed before it returns,
//! so a run that dies partway through a long backfill leaves every page it had
//! accepted on disk, readable and resumable.

use crate::domain::{Bar, Resolution, Timespan};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Column order of every record file.
pub const HEADER: [&str; 8] = [
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "vwap",
    "transactions",
];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error on {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{} does not look like a record file (header: {found})", .path.display())]
    HeaderMismatch { path: PathBuf, found: String },
}

impl SinkError {
    /// File the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            SinkError::Io { path, .. }
            | SinkError::Csv { path, .. }
            | SinkError::HeaderMismatch { path, .. } => path,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        SinkError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Record file name for one run: `MSFT_minute_historical.csv`, `MSFT_5minute_historical.csv`.
pub fn record_file_name(ticker: &str, resolution: Resolution) -> String {
    format!(
        "{}_{}_historical.csv",
        ticker.to_ascii_uppercase(),
        resolution.file_fragment()
    )
}

/// Destination that durably accumulates fetched bars for one run.
pub trait RecordSink {
    /// Append a batch in order. Empty batches are a no-op.
    fn append(&mut self, bars: &[Bar]) -> Result<(), SinkError>;

    /// Flush and close, returning the total number of records in the destination.
    fn finalize(self) -> Result<u64, SinkError>
    where
        Self: Sized;

    /// Where the records go.
    fn destination(&self) -> &Path;

    /// Records in the destination so far, including any present before a resume.
    fn written(&self) -> u64;

    /// Timestamp of the last record in the destination.
    fn last_timestamp(&self) -> Option<i64>;
}

/// Summary of an existing record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    /// Bucket unit guessed from the file name (`day`, `hour`, `min`).
    pub frequency: Option<Timespan>,
}

/// Read a record file and report its row count and timestamp span.
pub fn summarize(path: &Path) -> Result<FileSummary, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| SinkError::csv(path, e))?;

    let headers = reader.headers().map_err(|e| SinkError::csv(path, e))?;
    if headers.iter().ne(HEADER.iter().copied()) {
        return Err(SinkError::HeaderMismatch {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    let mut rows = 0u64;
    let mut first_timestamp = None;
    let mut last_timestamp = None;
    for record in reader.deserialize::<Bar>() {
        let bar = record.map_err(|e| SinkError::csv(path, e))?;
        first_timestamp.get_or_insert(bar.timestamp);
        last_timestamp = Some(bar.timestamp);
        rows += 1;
    }

    Ok(FileSummary {
        path: path.to_path_buf(),
        rows,
        first_timestamp,
        last_timestamp,
        frequency: frequency_from_name(path),
    })
}

fn frequency_from_name(path: &Path) -> Option<Timespan> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.contains("day") {
        Some(Timespan::Day)
    } else if name.contains("hour") {
        Some(Timespan::Hour)
    } else if name.contains("min") {
        Some(Timespan::Minute)
    } else {
        None
    }
}

/// CSV file sink with append semantics and a single header row.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    header_written: bool,
    written: u64,
    last_timestamp: Option<i64>,
}

impl CsvSink {
    /// Create (or truncate) the file at `path`. Parent directories are created.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| SinkError::io(&path, e))?;
        Ok(Self::from_file(path, file, false, 0, None))
    }

    /// Reopen an existing record file for appending.
    ///
    /// Counts the rows already present and remembers the last timestamp so the
    /// caller can continue without rewriting them. A partial last row left by an
    /// interrupted append is cut off first. A missing or empty file is created
    /// fresh.
    pub fn resume(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let existing_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(SinkError::io(&path, e)),
        };
        let existing_len = if existing_len > 0 {
            drop_torn_tail(&path, existing_len)?
        } else {
            0
        };
        if existing_len == 0 {
            return Self::create(path);
        }

        let summary = summarize(&path)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| SinkError::io(&path, e))?;
        Ok(Self::from_file(
            path,
            file,
            true,
            summary.rows,
            summary.last_timestamp,
        ))
    }

    fn from_file(
        path: PathBuf,
        file: File,
        header_written: bool,
        written: u64,
        last_timestamp: Option<i64>,
    ) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        Self {
            path,
            writer,
            header_written,
            written,
            last_timestamp,
        }
    }
}

/// Truncate `path` back to its last newline. Returns the resulting length.
fn drop_torn_tail(path: &Path, len: u64) -> Result<u64, SinkError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| SinkError::io(path, e))?;

    let mut buf = [0u8; 8192];
    let mut end = len;
    let mut keep = 0;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(chunk))
            .map_err(|e| SinkError::io(path, e))?;
        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(len);
        }
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            keep = start + i as u64 + 1;
            break;
        }
        end = start;
    }

    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "dropping incomplete trailing record"
    );
    file.set_len(keep).map_err(|e| SinkError::io(path, e))?;
    Ok(keep)
}

impl RecordSink for CsvSink {
    fn append(&mut self, bars: &[Bar]) -> Result<(), SinkError> {
        if bars.is_empty() {
            return Ok(());
        }

        if !self.header_written {
            self.writer
                .write_record(HEADER)
                .map_err(|e| SinkError::csv(&self.path, e))?;
            self.header_written = true;
        }

        for bar in bars {
            self.writer
                .serialize(bar)
                .map_err(|e| SinkError::csv(&self.path, e))?;
        }
        self.writer
            .flush()
            .map_err(|e| SinkError::io(&self.path, e))?;

        self.written += bars.len() as u64;
        self.last_timestamp = bars.last().map(|b| b.timestamp);
        Ok(())
    }

    fn finalize(mut self) -> Result<u64, SinkError> {
        self.writer
            .flush()
            .map_err(|e| SinkError::io(&self.path, e))?;
        Ok(self.written)
    }

    fn destination(&self) -> &Path {
        &self.path
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }
}
