//! Market Data Types
//!
//! The authoritative per-symbol record ([`MarketData`]) and the partial
//! updates ([`MarketDataPatch`]) that push messages, REST snapshots and cache
//! hits are reduced to before being merged.
//!
//! # Merge Rules
//!
//! - Every field present in a patch overwrites the stored value (last write
//!   by apply time wins, regardless of source).
//! - `last_updated` and `metadata` come from the merge, never from the patch,
//!   and `last_updated` never moves backwards.
//! - A patch carrying a price but no change is completed from the stored
//!   previous close.

mod reliability;

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use reliability::{ReliabilityPolicy, StalenessTier};

/// Maximum accepted ticker length.
const MAX_SYMBOL_LEN: usize = 16;

// =============================================================================
// Symbol
// =============================================================================

/// Uppercase ticker symbol (e.g. `AAPL`, `BRK.B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Parse and normalize a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] if the ticker is empty, too long, or contains
    /// characters other than ASCII letters, digits, `.` and `-`.
    pub fn new(raw: &str) -> Result<Self, SymbolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SymbolError::Empty);
        }
        if trimmed.len() > MAX_SYMBOL_LEN {
            return Err(SymbolError::TooLong(trimmed.to_string()));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(SymbolError::InvalidCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Ticker text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

/// Invalid ticker symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Empty or whitespace-only input.
    #[error("symbol cannot be empty")]
    Empty,
    /// Longer than the accepted maximum.
    #[error("symbol too long: {0}")]
    TooLong(String),
    /// Contains unsupported characters.
    #[error("symbol contains invalid characters: {0}")]
    InvalidCharacters(String),
}

// =============================================================================
// Data Source
// =============================================================================

/// Where a market data update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Streaming push feed.
    Push,
    /// REST snapshot endpoint.
    Rest,
    /// Local cache hit.
    Cache,
}

impl DataSource {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Rest => "rest",
            Self::Cache => "cache",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Patch
// =============================================================================

/// Partial market data update. `None` fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDataPatch {
    /// Last price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Absolute change versus previous close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Decimal>,
    /// Percentage change versus previous close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
    /// Session volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    /// Best bid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    /// Best ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    /// Session open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,
    /// Session high.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    /// Session low.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    /// Previous session close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_close: Option<Decimal>,
    /// Provider timestamp of the observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
    /// Intraday bar high. Widens the session high instead of replacing it.
    #[serde(skip)]
    pub bar_high: Option<Decimal>,
    /// Intraday bar low. Widens the session low instead of replacing it.
    #[serde(skip)]
    pub bar_low: Option<Decimal>,
}

impl MarketDataPatch {
    /// Patch carrying only a last price.
    #[must_use]
    pub fn price(price: Decimal) -> Self {
        Self {
            price: Some(price),
            ..Self::default()
        }
    }

    /// Set the volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: u64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set the previous close.
    #[must_use]
    pub const fn with_previous_close(mut self, previous_close: Decimal) -> Self {
        self.previous_close = Some(previous_close);
        self
    }

    /// Set the provider timestamp.
    #[must_use]
    pub const fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// True if the patch carries no field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject patches that would put invalid data into the store.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty patches, negative prices or an
    /// inverted high/low range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }

        let prices = [
            ("price", self.price),
            ("bid", self.bid),
            ("ask", self.ask),
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("bar_high", self.bar_high),
            ("bar_low", self.bar_low),
            ("previous_close", self.previous_close),
        ];
        for (field, value) in prices {
            if let Some(v) = value
                && v.is_sign_negative()
                && !v.is_zero()
            {
                return Err(ValidationError::NegativePrice { field, value: v });
            }
        }

        if let (Some(high), Some(low)) = (self.high, self.low)
            && high < low
        {
            return Err(ValidationError::InvertedRange { high, low });
        }
        if let (Some(high), Some(low)) = (self.bar_high, self.bar_low)
            && high < low
        {
            return Err(ValidationError::InvertedRange { high, low });
        }

        Ok(())
    }
}

/// Patch rejected before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No field set.
    #[error("patch carries no fields")]
    EmptyPatch,
    /// A price field is negative.
    #[error("negative {field}: {value}")]
    NegativePrice {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },
    /// High below low.
    #[error("high {high} below low {low}")]
    InvertedRange {
        /// Session high.
        high: Decimal,
        /// Session low.
        low: Decimal,
    },
}

// =============================================================================
// Market Data Record
// =============================================================================

/// Derived trust information for a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metadata {
    /// Source of the most recent merge.
    pub source: DataSource,
    /// Confidence in `0.0..=1.0`.
    pub reliability: f64,
    /// Time since `last_updated`.
    pub staleness: Duration,
}

/// Authoritative market data for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    /// Ticker (immutable identity).
    pub symbol: Symbol,
    /// Last price.
    pub price: Option<Decimal>,
    /// Absolute change versus previous close.
    pub change: Option<Decimal>,
    /// Percentage change versus previous close.
    pub change_percent: Option<Decimal>,
    /// Session volume.
    pub volume: Option<u64>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Session open.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
    /// Previous session close.
    pub previous_close: Option<Decimal>,
    /// Provider timestamp of the latest observation.
    pub as_of: Option<DateTime<Utc>>,
    /// Monotonic instant of the last merge.
    pub last_updated: Instant,
    /// Source, reliability and staleness.
    pub metadata: Metadata,
}

impl MarketData {
    /// Empty record created at `now`.
    #[must_use]
    pub const fn new(symbol: Symbol, source: DataSource, now: Instant) -> Self {
        Self {
            symbol,
            price: None,
            change: None,
            change_percent: None,
            volume: None,
            bid: None,
            ask: None,
            open: None,
            high: None,
            low: None,
            previous_close: None,
            as_of: None,
            last_updated: now,
            metadata: Metadata {
                source,
                reliability: 0.0,
                staleness: Duration::ZERO,
            },
        }
    }

    /// Merge a patch in place.
    pub fn apply(&mut self, patch: &MarketDataPatch, source: DataSource, now: Instant) {
        overwrite(&mut self.price, patch.price);
        overwrite(&mut self.change, patch.change);
        overwrite(&mut self.change_percent, patch.change_percent);
        overwrite(&mut self.volume, patch.volume);
        overwrite(&mut self.bid, patch.bid);
        overwrite(&mut self.ask, patch.ask);
        overwrite(&mut self.open, patch.open);
        overwrite(&mut self.high, patch.high);
        overwrite(&mut self.low, patch.low);
        overwrite(&mut self.previous_close, patch.previous_close);
        overwrite(&mut self.as_of, patch.as_of);
        widen(&mut self.high, patch.bar_high, Decimal::max);
        widen(&mut self.low, patch.bar_low, Decimal::min);

        if let Some(price) = patch.price
            && patch.change.is_none()
            && let Some(previous) = self.previous_close
        {
            let change = price - previous;
            self.change = Some(change);
            self.change_percent = change
                .checked_div(previous)
                .map(|ratio| (ratio * Decimal::ONE_HUNDRED).round_dp(4));
        }

        self.last_updated = self.last_updated.max(now);
        self.metadata.source = source;
    }

    /// Recompute staleness and reliability as of `now`.
    pub fn refresh_metadata(&mut self, now: Instant, policy: &ReliabilityPolicy) {
        let staleness = now.saturating_duration_since(self.last_updated);
        self.metadata.staleness = staleness;
        self.metadata.reliability = policy.score(self.metadata.source, staleness);
    }

    /// Copy with metadata recomputed as of `now`.
    #[must_use]
    pub fn observed_at(&self, now: Instant, policy: &ReliabilityPolicy) -> Self {
        let mut copy = self.clone();
        copy.refresh_metadata(now, policy);
        copy
    }

    /// All populated fields as a patch (used for cache write-through).
    #[must_use]
    pub fn to_patch(&self) -> MarketDataPatch {
        MarketDataPatch {
            price: self.price,
            change: self.change,
            change_percent: self.change_percent,
            volume: self.volume,
            bid: self.bid,
            ask: self.ask,
            open: self.open,
            high: self.high,
            low: self.low,
            previous_close: self.previous_close,
            as_of: self.as_of,
            ..MarketDataPatch::default()
        }
    }
}

fn overwrite<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn widen(slot: &mut Option<Decimal>, value: Option<Decimal>, pick: fn(Decimal, Decimal) -> Decimal) {
    if let Some(value) = value {
        *slot = Some(slot.map_or(value, |current| pick(current, value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn symbol_normalizes_case_and_whitespace() {
        let symbol = Symbol::new("  aapl ").unwrap();
        assert_eq!(symbol.as_str(), "AAPL");
        assert_eq!(Symbol::new("brk.b").unwrap().as_str(), "BRK.B");
    }

    #[test]
    fn symbol_rejects_garbage() {
        assert_eq!(Symbol::new("   "), Err(SymbolError::Empty));
        assert!(matches!(
            Symbol::new("AA PL"),
            Err(SymbolError::InvalidCharacters(_))
        ));
        assert!(matches!(
            Symbol::new("ABCDEFGHIJKLMNOPQRSTUVWXYZ"),
            Err(SymbolError::TooLong(_))
        ));
    }

    #[test]
    fn symbol_deserializes_through_validation() {
        let symbol: Symbol = serde_json::from_str("\"msft\"").unwrap();
        assert_eq!(symbol.as_str(), "MSFT");
        assert!(serde_json::from_str::<Symbol>("\"\"").is_err());
    }

    #[test]
    fn apply_overwrites_only_present_fields() {
        let now = Instant::now();
        let mut data = MarketData::new(Symbol::new("AAPL").unwrap(), DataSource::Rest, now);
        data.apply(
            &MarketDataPatch {
                price: Some(dec("190.10")),
                volume: Some(1_000),
                bid: Some(dec("190.05")),
                ..MarketDataPatch::default()
            },
            DataSource::Rest,
            now,
        );

        data.apply(&MarketDataPatch::price(dec("190.50")), DataSource::Push, now);

        assert_eq!(data.price, Some(dec("190.50")));
        assert_eq!(data.volume, Some(1_000));
        assert_eq!(data.bid, Some(dec("190.05")));
        assert_eq!(data.metadata.source, DataSource::Push);
    }

    #[test]
    fn price_without_change_derives_from_previous_close() {
        let now = Instant::now();
        let mut data = MarketData::new(Symbol::new("AAPL").unwrap(), DataSource::Rest, now);
        data.apply(
            &MarketDataPatch::default().with_previous_close(dec("200")),
            DataSource::Rest,
            now,
        );
        data.apply(&MarketDataPatch::price(dec("210")), DataSource::Push, now);

        assert_eq!(data.change, Some(dec("10")));
        assert_eq!(data.change_percent, Some(dec("5")));
    }

    #[test]
    fn last_updated_never_rewinds() {
        let earlier = Instant::now();
        let later = earlier + Duration::from_secs(5);
        let mut data = MarketData::new(Symbol::new("AAPL").unwrap(), DataSource::Push, later);

        data.apply(&MarketDataPatch::price(dec("1")), DataSource::Rest, earlier);

        assert_eq!(data.last_updated, later);
        assert_eq!(data.price, Some(dec("1")));
    }

    #[test]
    fn bar_extremes_widen_the_session_range() {
        let now = Instant::now();
        let mut data = MarketData::new(Symbol::new("AAPL").unwrap(), DataSource::Rest, now);
        data.apply(
            &MarketDataPatch {
                high: Some(dec("191.0")),
                low: Some(dec("188.7")),
                ..MarketDataPatch::default()
            },
            DataSource::Rest,
            now,
        );

        let inside = MarketDataPatch {
            bar_high: Some(dec("190.5")),
            bar_low: Some(dec("190.1")),
            ..MarketDataPatch::default()
        };
        data.apply(&inside, DataSource::Push, now);
        assert_eq!((data.high, data.low), (Some(dec("191.0")), Some(dec("188.7"))));

        let breakout = MarketDataPatch {
            bar_high: Some(dec("192.3")),
            bar_low: Some(dec("191.8")),
            ..MarketDataPatch::default()
        };
        data.apply(&breakout, DataSource::Push, now);
        assert_eq!((data.high, data.low), (Some(dec("192.3")), Some(dec("188.7"))));
    }

    #[test]
    fn bar_extremes_seed_an_empty_range() {
        let now = Instant::now();
        let mut data = MarketData::new(Symbol::new("MSFT").unwrap(), DataSource::Push, now);
        data.apply(
            &MarketDataPatch {
                bar_high: Some(dec("410")),
                bar_low: Some(dec("399")),
                ..MarketDataPatch::default()
            },
            DataSource::Push,
            now,
        );
        assert_eq!((data.high, data.low), (Some(dec("410")), Some(dec("399"))));
    }

    #[test]
    fn validate_rejects_invalid_patches() {
        assert_eq!(
            MarketDataPatch::default().validate(),
            Err(ValidationError::EmptyPatch)
        );
        assert!(matches!(
            MarketDataPatch::price(dec("-1")).validate(),
            Err(ValidationError::NegativePrice { field: "price", .. })
        ));
        let inverted = MarketDataPatch {
            high: Some(dec("10")),
            low: Some(dec("11")),
            ..MarketDataPatch::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ValidationError::InvertedRange { .. })
        ));
        assert!(MarketDataPatch::price(dec("0")).validate().is_ok());
    }

    #[test]
    fn to_patch_captures_populated_fields() {
        let now = Instant::now();
        let mut data = MarketData::new(Symbol::new("AAPL").unwrap(), DataSource::Rest, now);
        let patch = MarketDataPatch::price(dec("12.5")).with_volume(42);
        data.apply(&patch, DataSource::Rest, now);

        assert_eq!(data.to_patch(), patch);
    }
}
