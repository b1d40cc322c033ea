//! Page fetcher trait and structured error types.
//!
//! The PageFetcher trait abstracts over the upstream aggregates endpoint so the
//! orchestrator can be driven by the HTTP implementation or by a scripted mock.

use crate::domain::{FetchRequest, Page, PageToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Upstream throttled the request (HTTP 429).
    RateLimited,
    /// Network failure, timeout, or 5xx.
    Transient,
    /// Response could not be decoded into a page.
    Malformed,
    /// Upstream refused the request (auth, unknown path, error status body).
    Rejected,
    /// The fetcher was cancelled before sending.
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure of a single page request.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("rate limited by upstream{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("cancelled before the request was sent")]
    Cancelled,
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Transient(_) => ErrorKind::Transient,
            FetchError::Malformed(_) => ErrorKind::Malformed,
            FetchError::Rejected { .. } => ErrorKind::Rejected,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Server-provided minimum wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Source of paged aggregate bars.
///
/// Each call performs exactly one upstream request. `token` is `None` for the
/// first page of a sub-interval and the previous page's cursor afterwards.
pub trait PageFetcher: Send + Sync {
    /// Name of this source. Logged per run; the CLI's default archive source.
    fn name(&self) -> &str;

    /// Fetch one page of bars for `request`.
    fn fetch(&self, request: &FetchRequest, token: Option<&PageToken>)
        -> Result<Page, FetchError>;
}

impl<T: PageFetcher + ?Sized> PageFetcher for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        token: Option<&PageToken>,
    ) -> Result<Page, FetchError> {
        (**self).fetch(request, token)
    }
}
