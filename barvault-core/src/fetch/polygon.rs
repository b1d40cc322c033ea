//! Polygon-style aggregates endpoint.
//!
//! One call per page: the first page of a sub-interval is requested by path
//! (`/v2/aggs/ticker/{ticker}/range/{mult}/{timespan}/{from}/{to}`), later pages
//! by following the `next_url` cursor the previous response handed back. Retry
//! decisions are not made here; failures are classified and returned.

use super::budget::RequestBudget;
use super::provider::{FetchError, PageFetcher};
use crate::cancel::CancelToken;
use crate::chunker::DATE_FORMAT;
use crate::domain::{Bar, FetchRequest, Page, PageToken};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Aggregates response envelope.
#[derive(Debug, Deserialize)]
struct AggsResponse {
    status: Option<String>,
    results: Option<Vec<AggRecord>>,
    next_url: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggRecord {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    vw: Option<f64>,
    n: Option<u64>,
}

impl From<AggRecord> for Bar {
    fn from(r: AggRecord) -> Self {
        Bar {
            timestamp: r.t,
            open: r.o,
            high: r.h,
            low: r.l,
            close: r.c,
            volume: r.v,
            vwap: r.vw,
            transactions: r.n,
        }
    }
}

/// HTTP fetcher for the aggregates endpoint.
pub struct PolygonFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    page_limit: u32,
    budget: Option<Arc<RequestBudget>>,
    cancel: CancelToken,
}

impl PolygonFetcher {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        page_limit: u32,
    ) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("barvault/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            page_limit,
            budget: None,
            cancel: CancelToken::new(),
        })
    }

    /// Pace every request through a shared budget.
    pub fn with_budget(mut self, budget: Arc<RequestBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Token that interrupts a budget wait.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// URL of the first page of a sub-interval.
    fn first_page_url(&self, request: &FetchRequest) -> Result<Url, FetchError> {
        let resolution = request.resolution();
        let interval = request.interval();
        let raw = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            request.instrument(),
            resolution.multiplier,
            resolution.timespan.as_str(),
            interval.start().format(DATE_FORMAT),
            interval.end().format(DATE_FORMAT),
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| FetchError::Malformed(format!("bad request URL {raw}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("adjusted", "true")
            .append_pair("sort", "asc")
            .append_pair("limit", &self.page_limit.to_string())
            .append_pair("apiKey", &self.api_key);
        Ok(url)
    }

    /// URL for a continuation cursor. Relative cursors resolve against the base URL,
    /// and the API key is appended when the cursor does not already carry one.
    fn continuation_url(&self, token: &PageToken) -> Result<Url, FetchError> {
        let mut url = match Url::parse(token.as_str()) {
            Ok(url) => url,
            Err(_) => Url::parse(&self.base_url)
                .and_then(|base| base.join(token.as_str()))
                .map_err(|e| FetchError::Malformed(format!("unusable cursor {token}: {e}")))?,
        };
        if !url.query_pairs().any(|(k, _)| k == "apiKey") {
            url.query_pairs_mut().append_pair("apiKey", &self.api_key);
        }
        Ok(url)
    }
}

impl PageFetcher for PolygonFetcher {
    fn name(&self) -> &str {
        "polygon"
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        token: Option<&PageToken>,
    ) -> Result<Page, FetchError> {
        if let Some(budget) = &self.budget {
            let wait = budget.reserve();
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "waiting for request budget");
                if !self.cancel.wait(wait) {
                    return Err(FetchError::Cancelled);
                }
            }
        }

        let url = match token {
            None => self.first_page_url(request)?,
            Some(token) => self.continuation_url(token)?,
        };
        debug!(%request, continuation = token.is_some(), "requesting page");

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transient(e.without_url().to_string()))?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp
            .text()
            .map_err(|e| FetchError::Transient(e.without_url().to_string()))?;

        if let Some(err) = classify_status(status, retry_after, &body) {
            warn!(%request, status, error = %err, "page request failed");
            return Err(err);
        }

        let page = decode_page(&body)?;
        debug!(
            %request,
            bars = page.bars.len(),
            has_next = page.next.is_some(),
            "page received"
        );
        Ok(page)
    }
}

/// Map a non-success HTTP status to a fetch error. `None` means success.
pub fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Option<FetchError> {
    match status {
        200..=299 => None,
        429 => Some(FetchError::RateLimited { retry_after }),
        408 | 500..=599 => Some(FetchError::Transient(format!("HTTP {status}"))),
        _ => Some(FetchError::Rejected {
            status,
            message: snippet(body),
        }),
    }
}

/// Decode one aggregates response body into a page.
pub fn decode_page(body: &str) -> Result<Page, FetchError> {
    let resp: AggsResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Malformed(format!("failed to parse aggregates response: {e}")))?;

    if let Some(status) = resp.status.as_deref() {
        if matches!(status, "ERROR" | "NOT_AUTHORIZED") {
            let message = resp
                .error
                .or(resp.message)
                .unwrap_or_else(|| status.to_string());
            return Err(FetchError::Rejected {
                status: 200,
                message,
            });
        }
    }

    let bars: Vec<Bar> = resp
        .results
        .unwrap_or_default()
        .into_iter()
        .map(Bar::from)
        .collect();
    let next = resp
        .next_url
        .filter(|u| !u.trim().is_empty())
        .map(PageToken::new);

    let page = Page::new(bars, next);
    if let Some(i) = page.first_out_of_order() {
        return Err(FetchError::Malformed(format!(
            "bars out of order at index {i} ({} after {})",
            page.bars[i].timestamp,
            page.bars[i - 1].timestamp
        )));
    }
    Ok(page)
}

fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
