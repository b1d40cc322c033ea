//! Instrument reference metadata (asset type, exchange, currency, name).
//!
//! Used to tag and key archived record files. Lookups never fail the caller:
//! any error falls back to stock-market defaults.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Descriptive metadata for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub asset_type: String,
    pub exchange: String,
    pub currency: String,
    pub name: String,
    pub market: String,
}

impl InstrumentMetadata {
    /// Fallback metadata used when a lookup fails.
    pub fn defaults(ticker: &str) -> Self {
        Self {
            asset_type: "stocks".into(),
            exchange: "NASDAQ".into(),
            currency: "USD".into(),
            name: ticker.to_string(),
            market: "stocks".into(),
        }
    }
}

/// Map an upstream type code to the asset-type path segment.
pub fn asset_type_for(code: &str) -> String {
    match code.to_ascii_lowercase().as_str() {
        "cs" | "common_stock" => "stocks".into(),
        "etf" => "etfs".into(),
        "crypto" => "crypto".into(),
        "fx" => "forex".into(),
        other => other.to_string(),
    }
}

/// Source of instrument metadata.
pub trait MetadataLookup: Send + Sync {
    /// Metadata for `ticker`. Never fails; returns defaults when unknown.
    fn lookup(&self, ticker: &str) -> InstrumentMetadata;
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    results: Option<TickerDetails>,
}

#[derive(Debug, Deserialize)]
struct TickerDetails {
    #[serde(rename = "type")]
    kind: Option<String>,
    primary_exchange: Option<String>,
    currency_name: Option<String>,
    name: Option<String>,
    market: Option<String>,
}

/// Reference-data client for `/v3/reference/tickers/{ticker}`.
pub struct PolygonReference {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl PolygonReference {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn try_lookup(&self, ticker: &str) -> Result<InstrumentMetadata, String> {
        let mut url = Url::parse(&format!("{}/v3/reference/tickers/{ticker}", self.base_url))
            .map_err(|e| e.to_string())?;
        url.query_pairs_mut().append_pair("apiKey", &self.api_key);

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| e.without_url().to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let body = resp.text().map_err(|e| e.without_url().to_string())?;
        parse_details(ticker, &body)
    }
}

impl MetadataLookup for PolygonReference {
    fn lookup(&self, ticker: &str) -> InstrumentMetadata {
        match self.try_lookup(ticker) {
            Ok(meta) => {
                debug!(ticker, asset_type = %meta.asset_type, "resolved instrument metadata");
                meta
            }
            Err(e) => {
                warn!(ticker, error = %e, "metadata lookup failed, using defaults");
                InstrumentMetadata::defaults(ticker)
            }
        }
    }
}

fn parse_details(ticker: &str, body: &str) -> Result<InstrumentMetadata, String> {
    let resp: TickerResponse = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let details = resp
        .results
        .ok_or_else(|| format!("no reference results for {ticker}"))?;
    let defaults = InstrumentMetadata::defaults(ticker);

    Ok(InstrumentMetadata {
        asset_type: details
            .kind
            .as_deref()
            .map(asset_type_for)
            .unwrap_or(defaults.asset_type),
        exchange: details.primary_exchange.unwrap_or(defaults.exchange),
        currency: details.currency_name.unwrap_or(defaults.currency),
        name: details.name.unwrap_or(defaults.name),
        market: details.market.unwrap_or(defaults.market),
    })
}
