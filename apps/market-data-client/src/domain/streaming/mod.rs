//! Streaming Event Types
//!
//! Typed events produced by the push feed and consumed by the reconciliation
//! store. Wire decoding happens in the feed adapter; by the time an event is
//! built here its symbol and prices have been validated.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::market_data::{MarketDataPatch, Symbol};

// =============================================================================
// Connection Status
// =============================================================================

/// Connection status exposed to presentation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No connection.
    #[default]
    Disconnected,
    /// Opening (or re-opening) the connection.
    Connecting,
    /// Transport open, authentication in progress.
    Connected,
    /// Authenticated; subscriptions are live.
    Authenticated,
    /// Reconnect attempts exhausted; requires external intervention.
    Offline,
}

impl ConnectionStatus {
    /// Status label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Offline => "offline",
        }
    }

    /// True once the feed has given up reconnecting.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Offline)
    }

    /// True when live data is flowing.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// Last-sale trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeTick {
    /// Ticker.
    pub symbol: Symbol,
    /// Trade price.
    pub price: Decimal,
    /// Trade size in shares.
    pub size: u64,
    /// Exchange timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Top-of-book quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteTick {
    /// Ticker.
    pub symbol: Symbol,
    /// Best bid.
    pub bid: Decimal,
    /// Bid size.
    pub bid_size: u64,
    /// Best ask.
    pub ask: Decimal,
    /// Ask size.
    pub ask_size: u64,
    /// Exchange timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-minute aggregate bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateBar {
    /// Ticker.
    pub symbol: Symbol,
    /// Day's opening price.
    pub open: Option<Decimal>,
    /// Bar high.
    pub high: Decimal,
    /// Bar low.
    pub low: Decimal,
    /// Bar close.
    pub close: Decimal,
    /// Volume within the bar.
    pub volume: u64,
    /// Volume accumulated for the session.
    pub accumulated_volume: Option<u64>,
    /// Bar end timestamp.
    pub end: Option<DateTime<Utc>>,
}

// =============================================================================
// Stream Event
// =============================================================================

/// Event dispatched from the push feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Trade print.
    Trade(TradeTick),
    /// Quote update.
    Quote(QuoteTick),
    /// Aggregate bar.
    Aggregate(AggregateBar),
    /// Connection status transition.
    Status(ConnectionStatus),
}

impl StreamEvent {
    /// Symbol for data events.
    #[must_use]
    pub const fn symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Trade(t) => Some(&t.symbol),
            Self::Quote(q) => Some(&q.symbol),
            Self::Aggregate(a) => Some(&a.symbol),
            Self::Status(_) => None,
        }
    }

    /// Event kind label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trade",
            Self::Quote(_) => "quote",
            Self::Aggregate(_) => "aggregate",
            Self::Status(_) => "status",
        }
    }

    /// Reduce a data event to a store patch.
    #[must_use]
    pub fn to_patch(&self) -> Option<MarketDataPatch> {
        match self {
            Self::Trade(trade) => Some(MarketDataPatch {
                price: Some(trade.price),
                as_of: trade.timestamp,
                ..MarketDataPatch::default()
            }),
            Self::Quote(quote) => Some(MarketDataPatch {
                bid: Some(quote.bid),
                ask: Some(quote.ask),
                as_of: quote.timestamp,
                ..MarketDataPatch::default()
            }),
            Self::Aggregate(bar) => Some(MarketDataPatch {
                price: Some(bar.close),
                volume: bar.accumulated_volume,
                open: bar.open,
                bar_high: Some(bar.high),
                bar_low: Some(bar.low),
                as_of: bar.end,
                ..MarketDataPatch::default()
            }),
            Self::Status(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test_case(ConnectionStatus::Disconnected, "disconnected")]
    #[test_case(ConnectionStatus::Connecting, "connecting")]
    #[test_case(ConnectionStatus::Connected, "connected")]
    #[test_case(ConnectionStatus::Authenticated, "authenticated")]
    #[test_case(ConnectionStatus::Offline, "offline")]
    fn status_labels_match_serialization(status: ConnectionStatus, label: &str) {
        assert_eq!(status.as_str(), label);
        assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{label}\""));
    }

    #[test]
    fn only_offline_is_terminal() {
        assert!(ConnectionStatus::Offline.is_terminal());
        assert!(!ConnectionStatus::Disconnected.is_terminal());
    }

    #[test]
    fn trade_patch_sets_price_only() {
        let event = StreamEvent::Trade(TradeTick {
            symbol: Symbol::new("AAPL").unwrap(),
            price: dec("191.20"),
            size: 100,
            timestamp: None,
        });

        let patch = event.to_patch().unwrap();
        assert_eq!(patch.price, Some(dec("191.20")));
        assert!(patch.bid.is_none());
        assert!(patch.volume.is_none());
    }

    #[test]
    fn aggregate_patch_uses_session_volume() {
        let event = StreamEvent::Aggregate(AggregateBar {
            symbol: Symbol::new("MSFT").unwrap(),
            open: Some(dec("400")),
            high: dec("410"),
            low: dec("399"),
            close: dec("405"),
            volume: 1_000,
            accumulated_volume: Some(2_500_000),
            end: None,
        });

        let patch = event.to_patch().unwrap();
        assert_eq!(patch.price, Some(dec("405")));
        assert_eq!(patch.volume, Some(2_500_000));
        assert_eq!(patch.open, Some(dec("400")));
        assert!(patch.high.is_none() && patch.low.is_none());
        assert_eq!((patch.bar_high, patch.bar_low), (Some(dec("410")), Some(dec("399"))));
        assert_eq!(event.kind(), "aggregate");
    }

    #[test]
    fn status_event_has_no_patch() {
        let event = StreamEvent::Status(ConnectionStatus::Authenticated);
        assert!(event.to_patch().is_none());
        assert!(event.symbol().is_none());
    }
}
