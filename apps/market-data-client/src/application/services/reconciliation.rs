//! Reconciliation Store
//!
//! Single authoritative [`MarketData`] record per symbol, merged from push
//! events, REST snapshots and cache hits.
//!
//! # Merge
//!
//! Last write by apply time wins for every field a patch carries (see
//! [`MarketData::apply`]). Reliability and staleness are recomputed on every
//! write and every read.
//!
//! # Notifications
//!
//! Writes mark the symbol dirty; a notifier task flushes dirty symbols after
//! `notify_debounce`, so a burst of ticks produces one callback per
//! subscriber with the latest record. Handlers run outside every lock.
//!
//! A subscriber that joins a symbol already holding data is queued for a
//! targeted delivery in the next flush; existing subscribers are not
//! re-notified.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cache::{CacheNamespace, CacheStore};
use crate::domain::clock::SharedClock;
use crate::domain::market_data::{
    DataSource, MarketData, MarketDataPatch, ReliabilityPolicy, Symbol, ValidationError,
};
use crate::domain::streaming::StreamEvent;
use crate::domain::subscription::{
    Registration, Removal, SubscriberId, SubscriberRegistry, UpdateHandler,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Store tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Window over which notifications for a symbol are coalesced.
    pub notify_debounce: Duration,
    /// Age after which an unsubscribed record is evicted.
    pub expiry: Duration,
    /// Reliability scoring.
    pub reliability: ReliabilityPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            notify_debounce: Duration::from_millis(50),
            expiry: Duration::from_secs(15 * 60),
            reliability: ReliabilityPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Create configuration from `StoreSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::StoreSettings) -> Self {
        Self {
            notify_debounce: settings.notify_debounce,
            expiry: settings.expiry,
            reliability: settings.reliability.clone(),
        }
    }
}

/// Outcome of [`ReconciliationStore::evict_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Records removed.
    pub evicted: usize,
    /// Stale records kept because they still have subscribers.
    pub retained_stale: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    All,
    Only(HashSet<SubscriberId>),
}

impl Delivery {
    fn merge(&mut self, other: Self) {
        match (self, other) {
            (Self::All, _) => {}
            (slot, Self::All) => *slot = Self::All,
            (Self::Only(ids), Self::Only(more)) => ids.extend(more),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Per-symbol record store with debounced fan-out.
#[derive(Debug)]
pub struct ReconciliationStore {
    config: StoreConfig,
    clock: SharedClock,
    records: DashMap<Symbol, MarketData>,
    subscribers: SubscriberRegistry,
    cache: Option<Arc<CacheStore>>,
    pending: Mutex<HashMap<Symbol, Delivery>>,
    dirty: Notify,
}

impl ReconciliationStore {
    /// Create a store without cache write-through.
    #[must_use]
    pub fn new(config: StoreConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            records: DashMap::new(),
            subscribers: SubscriberRegistry::new(),
            cache: None,
            pending: Mutex::new(HashMap::new()),
            dirty: Notify::new(),
        }
    }

    /// Write every non-cache update through to `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Merge a patch into the symbol's record.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the patch is rejected; neither the
    /// store nor the cache is touched in that case.
    pub fn update(
        &self,
        symbol: &Symbol,
        patch: &MarketDataPatch,
        source: DataSource,
    ) -> Result<MarketData, ValidationError> {
        if let Err(e) = patch.validate() {
            tracing::warn!(symbol = %symbol, source = %source, error = %e, "Rejected market data update");
            return Err(e);
        }

        let now = self.clock.now();
        let snapshot = {
            let mut record = self
                .records
                .entry(symbol.clone())
                .or_insert_with(|| MarketData::new(symbol.clone(), source, now));
            record.apply(patch, source, now);
            record.refresh_metadata(now, &self.config.reliability);
            record.clone()
        };

        if source != DataSource::Cache {
            self.write_through(&snapshot, source);
        }

        metrics::record_store_update(source.as_str());
        self.schedule(symbol, Delivery::All);

        tracing::trace!(symbol = %symbol, source = %source, "Market data merged");
        Ok(snapshot)
    }

    /// Merge a push-feed event. Status events are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the derived patch is rejected.
    pub fn apply_feed_event(&self, event: &StreamEvent) -> Result<Option<MarketData>, ValidationError> {
        let (Some(symbol), Some(patch)) = (event.symbol(), event.to_patch()) else {
            return Ok(None);
        };
        self.update(symbol, &patch, DataSource::Push).map(Some)
    }

    /// Current record with metadata recomputed as of now.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<MarketData> {
        let now = self.clock.now();
        self.records
            .get(symbol)
            .map(|record| record.observed_at(now, &self.config.reliability))
    }

    /// Current record if it is younger than `max_age`.
    #[must_use]
    pub fn get_fresh(&self, symbol: &Symbol, max_age: Duration) -> Option<MarketData> {
        self.get(symbol)
            .filter(|data| data.metadata.staleness < max_age)
    }

    /// Register a handler. If the symbol already holds data the new handler
    /// receives it in the next flush.
    pub fn subscribe(&self, symbol: &Symbol, handler: UpdateHandler) -> Registration {
        let registration = self.subscribers.add(symbol, handler);
        if self.records.contains_key(symbol) {
            self.schedule(symbol, Delivery::Only(HashSet::from([registration.id])));
        }
        metrics::set_subscriptions(self.subscribers.total_subscribers());
        registration
    }

    /// Remove a handler. The record is kept for reuse.
    pub fn unsubscribe(&self, symbol: &Symbol, id: SubscriberId) -> Removal {
        let removal = self.subscribers.remove(symbol, id);
        metrics::set_subscriptions(self.subscribers.total_subscribers());
        removal
    }

    /// True if the symbol has at least one handler.
    #[must_use]
    pub fn has_subscribers(&self, symbol: &Symbol) -> bool {
        self.subscribers.has_subscribers(symbol)
    }

    /// Handler count for a symbol.
    #[must_use]
    pub fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.subscribers.count(symbol)
    }

    /// Symbols with at least one handler.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.subscribers.symbols()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove unsubscribed records older than `expiry`. Subscribed records
    /// are only reported.
    pub fn evict_stale(&self) -> EvictionReport {
        let now = self.clock.now();
        let expiry = self.config.expiry;
        let mut report = EvictionReport::default();

        self.records.retain(|symbol, record| {
            if now.saturating_duration_since(record.last_updated) <= expiry {
                return true;
            }
            if self.subscribers.has_subscribers(symbol) {
                report.retained_stale += 1;
                return true;
            }
            report.evicted += 1;
            false
        });

        if report.evicted > 0 || report.retained_stale > 0 {
            tracing::info!(
                evicted = report.evicted,
                retained_stale = report.retained_stale,
                "Stale market data swept"
            );
        }
        report
    }

    /// Deliver all pending notifications now. Returns the number of handler
    /// invocations.
    pub fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return 0;
        }

        let now = self.clock.now();
        let mut delivered = 0;
        for (symbol, delivery) in pending {
            let Some(data) = self
                .records
                .get(&symbol)
                .map(|record| record.observed_at(now, &self.config.reliability))
            else {
                continue;
            };

            let handlers: Vec<UpdateHandler> = match delivery {
                Delivery::All => self
                    .subscribers
                    .handlers(&symbol)
                    .into_iter()
                    .map(|(_, handler)| handler)
                    .collect(),
                Delivery::Only(ids) => ids
                    .into_iter()
                    .filter_map(|id| self.subscribers.handler(&symbol, id))
                    .collect(),
            };

            metrics::record_notification_fanout(handlers.len());
            for handler in handlers {
                handler(&data);
                delivered += 1;
            }
        }
        delivered
    }

    /// Spawn the debounced notifier.
    pub fn spawn_notifier(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = store.dirty.notified() => {}
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(store.config.notify_debounce) => {}
                }

                store.flush();
            }
            tracing::debug!("Store notifier stopped");
        })
    }

    fn schedule(&self, symbol: &Symbol, delivery: Delivery) {
        match self.pending.lock().entry(symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(delivery);
            }
            Entry::Occupied(mut slot) => slot.get_mut().merge(delivery),
        }
        self.dirty.notify_one();
    }

    fn write_through(&self, snapshot: &MarketData, source: DataSource) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = snapshot.symbol.as_str();
        if let Err(e) = cache.set(
            CacheNamespace::MarketData,
            key,
            &snapshot.to_patch(),
            source,
            &[key],
        ) {
            tracing::warn!(symbol = %snapshot.symbol, error = %e, "Cache write-through failed");
        }
    }
}
