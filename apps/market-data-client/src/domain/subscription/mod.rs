//! Subscriber Registry
//!
//! Tracks which handlers are interested in which symbols and reports the
//! transitions that matter upstream: the first subscriber for a symbol
//! (start fetching / request the push channel) and the last one leaving
//! (release the push channel).
//!
//! # Design
//!
//! Symbols are sharded across a [`DashMap`], so subscribe/unsubscribe on
//! different symbols never contend. First/last detection happens while the
//! symbol's shard is locked, so two concurrent subscribers can never both
//! observe `first == true`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::market_data::{MarketData, Symbol};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a registered handler.
pub type SubscriberId = u64;

/// Callback invoked with the latest record for a symbol.
pub type UpdateHandler = Arc<dyn Fn(&MarketData) + Send + Sync>;

/// Result of registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Identifier to unsubscribe with.
    pub id: SubscriberId,
    /// True if this is the only subscriber for the symbol.
    pub first: bool,
}

/// Result of removing a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Unknown symbol or id.
    NotFound,
    /// Removed; other subscribers remain.
    Removed,
    /// Removed the last subscriber for the symbol.
    LastRemoved,
}

impl Removal {
    /// True if the symbol no longer has subscribers.
    #[must_use]
    pub const fn was_last(self) -> bool {
        matches!(self, Self::LastRemoved)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Symbol → subscriber set.
#[derive(Default)]
pub struct SubscriberRegistry {
    symbols: DashMap<Symbol, HashMap<SubscriberId, UpdateHandler>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("symbols", &self.symbols.len())
            .field("subscribers", &self.total_subscribers())
            .finish()
    }
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a symbol.
    pub fn add(&self, symbol: &Symbol, handler: UpdateHandler) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = self.symbols.entry(symbol.clone()).or_default();
        entry.insert(id, handler);
        let first = entry.len() == 1;
        drop(entry);

        tracing::debug!(symbol = %symbol, subscriber = id, first, "Subscriber added");
        Registration { id, first }
    }

    /// Remove a handler.
    pub fn remove(&self, symbol: &Symbol, id: SubscriberId) -> Removal {
        let Some(mut entry) = self.symbols.get_mut(symbol) else {
            return Removal::NotFound;
        };
        if entry.remove(&id).is_none() {
            return Removal::NotFound;
        }
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty
            && self
                .symbols
                .remove_if(symbol, |_, subscribers| subscribers.is_empty())
                .is_some()
        {
            tracing::debug!(symbol = %symbol, subscriber = id, "Last subscriber removed");
            return Removal::LastRemoved;
        }

        Removal::Removed
    }

    /// Snapshot of all handlers for a symbol.
    #[must_use]
    pub fn handlers(&self, symbol: &Symbol) -> Vec<(SubscriberId, UpdateHandler)> {
        self.symbols
            .get(symbol)
            .map(|subs| {
                subs.iter()
                    .map(|(id, handler)| (*id, Arc::clone(handler)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handler for one subscriber.
    #[must_use]
    pub fn handler(&self, symbol: &Symbol, id: SubscriberId) -> Option<UpdateHandler> {
        self.symbols
            .get(symbol)
            .and_then(|subs| subs.get(&id).map(Arc::clone))
    }

    /// True if the symbol has at least one subscriber.
    #[must_use]
    pub fn has_subscribers(&self, symbol: &Symbol) -> bool {
        self.symbols
            .get(symbol)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Subscriber count for a symbol.
    #[must_use]
    pub fn count(&self, symbol: &Symbol) -> usize {
        self.symbols.get(symbol).map_or(0, |subs| subs.len())
    }

    /// Symbols with at least one subscriber.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .symbols
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Total handlers across all symbols.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.symbols.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn noop() -> UpdateHandler {
        Arc::new(|_: &MarketData| {})
    }

    #[test]
    fn first_and_last_transitions() {
        let registry = SubscriberRegistry::new();
        let aapl = sym("AAPL");

        let a = registry.add(&aapl, noop());
        let b = registry.add(&aapl, noop());
        assert!(a.first);
        assert!(!b.first);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.count(&aapl), 2);

        assert_eq!(registry.remove(&aapl, a.id), Removal::Removed);
        assert!(registry.has_subscribers(&aapl));
        assert_eq!(registry.remove(&aapl, b.id), Removal::LastRemoved);
        assert!(!registry.has_subscribers(&aapl));
        assert!(registry.symbols().is_empty());
    }

    #[test]
    fn removing_unknown_is_not_found() {
        let registry = SubscriberRegistry::new();
        let aapl = sym("AAPL");
        assert_eq!(registry.remove(&aapl, 7), Removal::NotFound);

        let reg = registry.add(&aapl, noop());
        assert_eq!(registry.remove(&aapl, reg.id + 100), Removal::NotFound);
        assert_eq!(registry.remove(&aapl, reg.id), Removal::LastRemoved);
        assert_eq!(registry.remove(&aapl, reg.id), Removal::NotFound);
    }

    #[test]
    fn resubscribe_after_last_is_first_again() {
        let registry = SubscriberRegistry::new();
        let msft = sym("MSFT");

        let reg = registry.add(&msft, noop());
        registry.remove(&msft, reg.id);
        assert!(registry.add(&msft, noop()).first);
    }

    #[test]
    fn concurrent_adds_yield_exactly_one_first() {
        let registry = Arc::new(SubscriberRegistry::new());
        let msft = sym("MSFT");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let msft = msft.clone();
                std::thread::spawn(move || registry.add(&msft, noop()).first)
            })
            .collect();

        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();

        assert_eq!(firsts, 1);
        assert_eq!(registry.count(&msft), 16);
    }

    #[test]
    fn symbols_are_sorted_and_counted() {
        let registry = SubscriberRegistry::new();
        registry.add(&sym("TSLA"), noop());
        registry.add(&sym("AAPL"), noop());
        registry.add(&sym("AAPL"), noop());

        assert_eq!(registry.symbols(), vec![sym("AAPL"), sym("TSLA")]);
        assert_eq!(registry.total_subscribers(), 3);
        assert_eq!(registry.handlers(&sym("AAPL")).len(), 2);
    }
}
