//! Push Feed Message Types
//!
//! Wire types for the provider's stock WebSocket.
//!
//! # Client Frames
//!
//! ```json
//! {"action":"auth","params":"<token>"}
//! {"action":"subscribe","params":"AM.AAPL,T.AAPL,Q.AAPL"}
//! {"action":"unsubscribe","params":"AM.AAPL,T.AAPL,Q.AAPL"}
//! ```
//!
//! # Server Frames
//!
//! JSON arrays of events discriminated by `ev`:
//!
//! ```json
//! [{"ev":"status","status":"auth_success","message":"authenticated"}]
//! [{"ev":"T","sym":"AAPL","p":190.12,"s":100,"t":1700000000000}]
//! [{"ev":"Q","sym":"AAPL","bp":190.1,"bs":3,"ap":190.14,"as":2,"t":1700000000000}]
//! [{"ev":"AM","sym":"AAPL","o":190.0,"h":190.5,"l":189.9,"c":190.2,"v":1200,"av":5400000,"op":188.7,"s":1700000000000,"e":1700000060000}]
//! ```
//!
//! Timestamps are Unix epoch milliseconds.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{Symbol, SymbolError};
use crate::domain::streaming::{AggregateBar, QuoteTick, StreamEvent, TradeTick};

// =============================================================================
// Channels
// =============================================================================

/// Per-symbol data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Per-minute aggregates (`AM`).
    Aggregate,
    /// Trades (`T`).
    Trade,
    /// Quotes (`Q`).
    Quote,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Self; 3] = [Self::Aggregate, Self::Trade, Self::Quote];

    /// Wire prefix.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Aggregate => "AM",
            Self::Trade => "T",
            Self::Quote => "Q",
        }
    }

    /// Parse a prefix or a channel name (`AM`, `aggregate`, `t`, `quote`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "am" | "aggregate" | "aggregates" => Some(Self::Aggregate),
            "t" | "trade" | "trades" => Some(Self::Trade),
            "q" | "quote" | "quotes" => Some(Self::Quote),
            _ => None,
        }
    }
}

// =============================================================================
// Client Frames
// =============================================================================

/// Client action verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Authenticate the connection.
    Auth,
    /// Add subscriptions.
    Subscribe,
    /// Remove subscriptions.
    Unsubscribe,
}

impl Action {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Frame sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientAction {
    /// Verb.
    pub action: Action,
    /// Token or comma-separated channel list.
    pub params: String,
}

impl ClientAction {
    /// Authentication frame.
    #[must_use]
    pub fn auth(token: &str) -> Self {
        Self {
            action: Action::Auth,
            params: token.to_string(),
        }
    }

    /// Subscribe frame for every channel of every symbol.
    #[must_use]
    pub fn subscribe(symbols: &[Symbol], channels: &[Channel]) -> Self {
        Self {
            action: Action::Subscribe,
            params: channel_params(symbols, channels),
        }
    }

    /// Unsubscribe frame for every channel of every symbol.
    #[must_use]
    pub fn unsubscribe(symbols: &[Symbol], channels: &[Channel]) -> Self {
        Self {
            action: Action::Unsubscribe,
            params: channel_params(symbols, channels),
        }
    }

    /// Symbols named by a subscribe/unsubscribe frame, in order, deduplicated.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        if self.action == Action::Auth {
            return Vec::new();
        }
        let mut symbols: Vec<String> = Vec::new();
        for entry in self.params.split(',') {
            if let Some((_, symbol)) = entry.split_once('.')
                && !symbols.iter().any(|s| s == symbol)
            {
                symbols.push(symbol.to_string());
            }
        }
        symbols
    }
}

fn channel_params(symbols: &[Symbol], channels: &[Channel]) -> String {
    symbols
        .iter()
        .flat_map(|symbol| {
            channels
                .iter()
                .map(move |channel| format!("{}.{}", channel.prefix(), symbol))
        })
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Server Frames
// =============================================================================

/// Control message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusMessage {
    /// Status code (`connected`, `auth_success`, `auth_failed`, `success`, ...).
    pub status: String,
    /// Human readable detail.
    #[serde(default)]
    pub message: String,
}

/// Interpreted status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Transport established.
    Connected,
    /// Authentication accepted.
    AuthSuccess,
    /// Authentication rejected.
    AuthFailed,
    /// Acknowledgement of a subscribe/unsubscribe.
    Success,
    /// Server-side error.
    Error,
    /// Anything else.
    Other,
}

impl StatusMessage {
    /// Interpret the status code.
    #[must_use]
    pub fn kind(&self) -> StatusKind {
        match self.status.as_str() {
            "connected" => StatusKind::Connected,
            "auth_success" => StatusKind::AuthSuccess,
            "auth_failed" | "auth_timeout" => StatusKind::AuthFailed,
            "success" => StatusKind::Success,
            "error" => StatusKind::Error,
            _ => StatusKind::Other,
        }
    }
}

/// Trade print.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeMessage {
    /// Ticker.
    pub sym: String,
    /// Price.
    pub p: Decimal,
    /// Size.
    #[serde(default)]
    pub s: u64,
    /// Exchange timestamp (ms).
    #[serde(default)]
    pub t: Option<i64>,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuoteMessage {
    /// Ticker.
    pub sym: String,
    /// Bid price.
    pub bp: Decimal,
    /// Bid size.
    #[serde(default)]
    pub bs: u64,
    /// Ask price.
    pub ap: Decimal,
    /// Ask size.
    #[serde(default, rename = "as")]
    pub ask_size: u64,
    /// Quote timestamp (ms).
    #[serde(default)]
    pub t: Option<i64>,
}

/// Per-minute aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AggregateMessage {
    /// Ticker.
    pub sym: String,
    /// Bar open.
    pub o: Decimal,
    /// Bar high.
    pub h: Decimal,
    /// Bar low.
    pub l: Decimal,
    /// Bar close.
    pub c: Decimal,
    /// Bar volume.
    #[serde(default)]
    pub v: u64,
    /// Accumulated session volume.
    #[serde(default)]
    pub av: Option<u64>,
    /// Day's official open.
    #[serde(default)]
    pub op: Option<Decimal>,
    /// Bar start (ms).
    #[serde(default)]
    pub s: Option<i64>,
    /// Bar end (ms).
    #[serde(default)]
    pub e: Option<i64>,
}

/// One element of a server frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "ev")]
pub enum ServerMessage {
    /// Control message.
    #[serde(rename = "status")]
    Status(StatusMessage),
    /// Trade.
    #[serde(rename = "T")]
    Trade(TradeMessage),
    /// Quote.
    #[serde(rename = "Q")]
    Quote(QuoteMessage),
    /// Aggregate.
    #[serde(rename = "AM")]
    Aggregate(AggregateMessage),
    /// Event type this client does not consume.
    #[serde(other)]
    Unknown,
}

// =============================================================================
// Validation
// =============================================================================

/// A data message that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Ticker is not a valid symbol.
    #[error("invalid symbol: {0}")]
    Symbol(#[from] SymbolError),
    /// Price field is negative.
    #[error("negative {field}: {value}")]
    NegativePrice {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },
    /// Bar high below bar low.
    #[error("aggregate high {high} below low {low}")]
    InvertedBar {
        /// High.
        high: Decimal,
        /// Low.
        low: Decimal,
    },
    /// Timestamp out of range.
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
}

fn non_negative(field: &'static str, value: Decimal) -> Result<Decimal, MessageError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(MessageError::NegativePrice { field, value });
    }
    Ok(value)
}

fn timestamp(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, MessageError> {
    millis
        .map(|ms| DateTime::from_timestamp_millis(ms).ok_or(MessageError::Timestamp(ms)))
        .transpose()
}

impl TryFrom<TradeMessage> for StreamEvent {
    type Error = MessageError;

    fn try_from(msg: TradeMessage) -> Result<Self, Self::Error> {
        Ok(Self::Trade(TradeTick {
            symbol: Symbol::new(&msg.sym)?,
            price: non_negative("price", msg.p)?,
            size: msg.s,
            timestamp: timestamp(msg.t)?,
        }))
    }
}

impl TryFrom<QuoteMessage> for StreamEvent {
    type Error = MessageError;

    fn try_from(msg: QuoteMessage) -> Result<Self, Self::Error> {
        Ok(Self::Quote(QuoteTick {
            symbol: Symbol::new(&msg.sym)?,
            bid: non_negative("bid", msg.bp)?,
            bid_size: msg.bs,
            ask: non_negative("ask", msg.ap)?,
            ask_size: msg.ask_size,
            timestamp: timestamp(msg.t)?,
        }))
    }
}

impl TryFrom<AggregateMessage> for StreamEvent {
    type Error = MessageError;

    fn try_from(msg: AggregateMessage) -> Result<Self, Self::Error> {
        let high = non_negative("high", msg.h)?;
        let low = non_negative("low", msg.l)?;
        if high < low {
            return Err(MessageError::InvertedBar { high, low });
        }
        non_negative("open", msg.o)?;
        Ok(Self::Aggregate(AggregateBar {
            symbol: Symbol::new(&msg.sym)?,
            open: msg.op.map(|op| non_negative("day_open", op)).transpose()?,
            high,
            low,
            close: non_negative("close", msg.c)?,
            volume: msg.v,
            accumulated_volume: msg.av,
            end: timestamp(msg.e)?,
        }))
    }
}
