//! Snapshot Client
//!
//! `GET {base}/v2/snapshot/locale/us/markets/stocks/tickers?tickers=A,B`
//!
//! ```json
//! {"status":"OK","tickers":[{
//!     "ticker":"AAPL","todaysChange":1.2,"todaysChangePerc":0.63,
//!     "updated":1700000000000000000,
//!     "day":{"o":189.1,"h":191.0,"l":188.7,"c":190.4,"v":51234000},
//!     "prevDay":{"c":189.2},
//!     "lastTrade":{"p":190.42},
//!     "lastQuote":{"p":190.41,"P":190.43}
//! }]}
//! ```
//!
//! Each ticker is validated on its own; a bad entry is logged, counted and
//! skipped. Zero prices are treated as "not reported".

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

use crate::application::ports::{SnapshotBatch, SnapshotError, SnapshotRecord, SnapshotSource};
use crate::domain::market_data::{MarketDataPatch, Symbol};
use crate::infrastructure::config::ApiKey;
use crate::infrastructure::metrics;

/// Wait applied when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// `updated` values at or above this are nanoseconds, below are milliseconds.
const NANOS_THRESHOLD: i64 = 100_000_000_000_000;

/// HTTP client construction errors.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Client could not be built.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Base URL is not usable.
    #[error("invalid base URL: {0}")]
    InvalidUrl(String),
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tickers: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerSnapshot {
    ticker: String,
    #[serde(default)]
    todays_change: Option<Decimal>,
    #[serde(default)]
    todays_change_perc: Option<Decimal>,
    #[serde(default)]
    updated: Option<i64>,
    #[serde(default)]
    day: Option<DayBar>,
    #[serde(default)]
    prev_day: Option<DayBar>,
    #[serde(default)]
    last_trade: Option<LastTrade>,
    #[serde(default)]
    last_quote: Option<LastQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct DayBar {
    #[serde(default)]
    o: Option<Decimal>,
    #[serde(default)]
    h: Option<Decimal>,
    #[serde(default)]
    l: Option<Decimal>,
    #[serde(default)]
    c: Option<Decimal>,
    #[serde(default)]
    v: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LastTrade {
    #[serde(default)]
    p: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LastQuote {
    #[serde(default)]
    p: Option<Decimal>,
    #[serde(default, rename = "P")]
    ask: Option<Decimal>,
}

fn reported(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| !v.is_zero())
}

fn updated_at(raw: i64) -> Option<DateTime<Utc>> {
    if raw >= NANOS_THRESHOLD {
        Some(DateTime::from_timestamp_nanos(raw))
    } else {
        DateTime::from_timestamp_millis(raw)
    }
}

impl TickerSnapshot {
    fn into_record(self) -> Result<SnapshotRecord, String> {
        let symbol = Symbol::new(&self.ticker).map_err(|e| e.to_string())?;
        let day = self.day.unwrap_or_default();

        let price = self
            .last_trade
            .and_then(|t| reported(t.p))
            .or_else(|| reported(day.c));
        let (bid, ask) = self
            .last_quote
            .map_or((None, None), |q| (reported(q.p), reported(q.ask)));

        let patch = MarketDataPatch {
            price,
            change: self.todays_change,
            change_percent: self.todays_change_perc,
            volume: day.v.and_then(|v| v.to_u64()).filter(|v| *v > 0),
            bid,
            ask,
            open: reported(day.o),
            high: reported(day.h),
            low: reported(day.l),
            previous_close: self.prev_day.and_then(|d| reported(d.c)),
            as_of: self.updated.and_then(updated_at),
            ..MarketDataPatch::default()
        };
        patch.validate().map_err(|e| e.to_string())?;

        Ok(SnapshotRecord { symbol, patch })
    }
}

// =============================================================================
// Client
// =============================================================================

/// REST snapshot client.
pub struct SnapshotClient {
    http: reqwest::Client,
    base_url: String,
    key: ApiKey,
}

impl fmt::Debug for SnapshotClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SnapshotClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`RestError`] if the base URL is empty or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, key: ApiKey, timeout: Duration) -> Result<Self, RestError> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(RestError::InvalidUrl("empty".to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            key,
        })
    }

    /// Create a client from the client configuration.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn from_config(config: &crate::ClientConfig) -> Result<Self, RestError> {
        Self::new(
            &config.endpoints.rest_url,
            config.api_key.clone(),
            config.endpoints.rest_timeout,
        )
    }

    fn url(&self, symbols: &[Symbol]) -> String {
        let tickers = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}/v2/snapshot/locale/us/markets/stocks/tickers?tickers={tickers}",
            self.base_url
        )
    }

    async fn request(&self, symbols: &[Symbol]) -> Result<SnapshotBatch, SnapshotError> {
        let response = self
            .http
            .get(self.url(symbols))
            .bearer_auth(self.key.expose())
            .send()
            .await
            .map_err(|e| SnapshotError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            return Err(SnapshotError::RateLimited { retry_after });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SnapshotError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SnapshotError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: SnapshotResponse = response
            .json()
            .await
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;

        if body.status.as_deref() == Some("ERROR") {
            return Err(SnapshotError::Status {
                status: status.as_u16(),
                message: body.error.unwrap_or_default(),
            });
        }

        let mut batch = SnapshotBatch::default();
        for value in body.tickers {
            let record = serde_json::from_value::<TickerSnapshot>(value)
                .map_err(|e| e.to_string())
                .and_then(TickerSnapshot::into_record);
            match record {
                Ok(record) => batch.records.push(record),
                Err(reason) => {
                    batch.rejected += 1;
                    metrics::record_malformed_message("snapshot");
                    tracing::warn!(reason = %reason, "Dropping malformed snapshot entry");
                }
            }
        }
        Ok(batch)
    }
}

const fn outcome(error: &SnapshotError) -> &'static str {
    match error {
        SnapshotError::RateLimited { .. } => "rate_limited",
        SnapshotError::Unauthorized => "unauthorized",
        SnapshotError::Network(_) | SnapshotError::Status { .. } | SnapshotError::Decode(_) => {
            "error"
        }
    }
}

#[async_trait]
impl SnapshotSource for SnapshotClient {
    async fn fetch_snapshots(&self, symbols: &[Symbol]) -> Result<SnapshotBatch, SnapshotError> {
        if symbols.is_empty() {
            return Ok(SnapshotBatch::default());
        }

        let started = Instant::now();
        let result = self.request(symbols).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(batch) => {
                metrics::record_rest_request("ok", elapsed);
                tracing::debug!(
                    requested = symbols.len(),
                    received = batch.records.len(),
                    rejected = batch.rejected,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Fetched snapshots"
                );
            }
            Err(e) => {
                metrics::record_rest_request(outcome(e), elapsed);
                tracing::warn!(requested = symbols.len(), error = %e, "Snapshot request failed");
            }
        }
        result
    }
}
