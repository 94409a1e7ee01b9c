//! Fetch Orchestrator
//!
//! The UI-facing entry point. Decides, per symbol, whether data comes from
//! the store, the cache, a rate-limited REST snapshot or the push feed.
//!
//! # Subscribe Flow
//!
//! ```text
//! subscribe(AAPL) ──► store.subscribe ──► first? ──no──► Joined
//!                                            │
//!                                           yes
//!                                            ▼
//!                 fresh store ─► cache ─► wait_for_token ─► REST ─► store
//!                                            │
//!                                            ▼
//!                            still subscribed? ─► feed.subscribe(AAPL)
//! ```
//!
//! Only the first subscriber for a symbol seeds it, so concurrent
//! first-subscribes share one fetch; the others receive the seeded record
//! through the store's notifications.
//!
//! # Push Interest
//!
//! Push subscribe (after a seed) and push unsubscribe (after the last
//! handler leaves) are decided under one lock, so a symbol is requested on
//! the feed exactly while it has subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cache::{CacheNamespace, CacheStore};
use super::client_error::ClientError;
use super::rate_limiter::RateLimiter;
use super::reconciliation::ReconciliationStore;
use crate::application::ports::{PushFeedPort, SnapshotError, SnapshotSource};
use crate::domain::market_data::{DataSource, MarketData, MarketDataPatch, Symbol};
use crate::domain::streaming::{ConnectionStatus, StreamEvent};
use crate::domain::subscription::{SubscriberId, UpdateHandler};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Rate limiter identity for REST calls.
    pub rest_identity: String,
    /// Longest a subscribe seed waits for a rate-limit token.
    pub max_wait: Duration,
    /// Store data younger than this is served without a fetch.
    pub fresh_for: Duration,
    /// Period of the store eviction pass.
    pub eviction_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rest_identity: "rest".to_string(),
            max_wait: Duration::from_secs(10),
            fresh_for: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    /// Create configuration from `ClientConfig`.
    #[must_use]
    pub fn from_config(config: &crate::ClientConfig) -> Self {
        Self {
            rest_identity: config.rate_limit.identity.clone(),
            max_wait: config.rate_limit.max_wait,
            fresh_for: config.cache.market_data_ttl,
            eviction_interval: config.store.eviction_interval,
        }
    }
}

// =============================================================================
// Seed Outcome
// =============================================================================

/// How a subscription's symbol was populated.
#[derive(Debug, Clone)]
pub enum SeedOutcome {
    /// Store already held fresh data.
    Store,
    /// Served from the cache.
    Cache,
    /// Fetched from the REST snapshot endpoint.
    Rest,
    /// Another subscriber is seeding (or already seeded) the symbol.
    Joined,
    /// No initial data; push updates will fill the record.
    Deferred(ClientError),
}

impl SeedOutcome {
    /// Label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Cache => "cache",
            Self::Rest => "rest",
            Self::Joined => "joined",
            Self::Deferred(_) => "deferred",
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    symbol: Symbol,
    id: SubscriberId,
    inner: Arc<Inner>,
    seed: Option<oneshot::Receiver<SeedOutcome>>,
    active: bool,
}

impl Subscription {
    /// Subscribed symbol.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Subscriber identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the initial seed of this subscription's symbol.
    pub async fn seeded(&mut self) -> SeedOutcome {
        let Some(seed) = self.seed.take() else {
            return SeedOutcome::Joined;
        };
        seed.await.unwrap_or_else(|_| {
            SeedOutcome::Deferred(ClientError::Upstream {
                message: "seed task aborted".to_string(),
                context: super::ErrorContext::new(Some(&self.symbol), DataSource::Rest),
            })
        })
    }

    /// Remove the handler explicitly.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.inner.release(&self.symbol, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// Client
// =============================================================================

struct Inner {
    config: OrchestratorConfig,
    store: Arc<ReconciliationStore>,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    rest: Arc<dyn SnapshotSource>,
    feed: Arc<dyn PushFeedPort>,
    seeding: Mutex<HashSet<Symbol>>,
    push_interest: Mutex<()>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataClient")
            .field("config", &self.config)
            .field("records", &self.store.len())
            .field("seeding", &self.seeding.lock().len())
            .finish_non_exhaustive()
    }
}

/// Market data client.
#[derive(Debug, Clone)]
pub struct MarketDataClient {
    inner: Arc<Inner>,
}

impl MarketDataClient {
    /// Wire a client from its components.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<ReconciliationStore>,
        cache: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
        rest: Arc<dyn SnapshotSource>,
        feed: Arc<dyn PushFeedPort>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache,
                limiter,
                rest,
                feed,
                seeding: Mutex::new(HashSet::new()),
                push_interest: Mutex::new(()),
            }),
        }
    }

    /// Reconciliation store.
    #[must_use]
    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.inner.store
    }

    /// Register a handler for a symbol.
    ///
    /// The first subscriber for a symbol starts a seed in the background;
    /// await [`Subscription::seeded`] to observe its outcome. Must be called
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidSymbol`] if the ticker is malformed.
    pub fn subscribe<F>(&self, symbol: &str, handler: F) -> Result<Subscription, ClientError>
    where
        F: Fn(&MarketData) + Send + Sync + 'static,
    {
        let symbol = Symbol::new(symbol)?;
        let handler: UpdateHandler = Arc::new(handler);
        let registration = self.inner.store.subscribe(&symbol, handler);

        let seed = if registration.first && self.inner.seeding.lock().insert(symbol.clone()) {
            let (tx, rx) = oneshot::channel();
            let inner = Arc::clone(&self.inner);
            let seed_symbol = symbol.clone();
            tokio::spawn(async move {
                let outcome = inner.seed(&seed_symbol).await;
                let _ = tx.send(outcome);
            });
            Some(rx)
        } else {
            None
        };

        tracing::info!(
            symbol = %symbol,
            subscriber = registration.id,
            first = registration.first,
            "Subscribed"
        );

        Ok(Subscription {
            symbol,
            id: registration.id,
            inner: Arc::clone(&self.inner),
            seed,
            active: true,
        })
    }

    /// Current data for a set of symbols.
    ///
    /// Fresh store data and cache hits are served locally; every remaining
    /// symbol is fetched with one batched REST call after a non-blocking
    /// rate-limit check. Symbols the provider does not report are absent
    /// from the result.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::RateLimited`] when a fetch is needed but no
    /// token is available (or the provider answers 429), and
    /// [`ClientError::Upstream`] / [`ClientError::Unauthorized`] for other
    /// fetch failures.
    pub async fn get_snapshot(
        &self,
        symbols: &[&str],
    ) -> Result<HashMap<Symbol, MarketData>, ClientError> {
        let inner = &self.inner;
        let mut result = HashMap::new();
        let mut misses = Vec::new();

        for raw in symbols {
            let symbol = Symbol::new(raw)?;
            if result.contains_key(&symbol) || misses.contains(&symbol) {
                continue;
            }
            if let Some(data) = inner.local(&symbol) {
                result.insert(symbol, data);
            } else {
                misses.push(symbol);
            }
        }

        if misses.is_empty() {
            return Ok(result);
        }

        let decision = inner.limiter.consume(&inner.config.rest_identity);
        if !decision.allowed {
            return Err(ClientError::RateLimited {
                retry_after: decision.retry_after,
                context: super::ErrorContext::new(misses.first(), DataSource::Rest),
            });
        }

        let batch = inner.fetch(&misses).await.map_err(|e| {
            let symbol = (misses.len() == 1).then(|| &misses[0]);
            ClientError::from_snapshot(e, symbol)
        })?;

        for record in batch.records {
            match inner
                .store
                .update(&record.symbol, &record.patch, DataSource::Rest)
            {
                Ok(data) => {
                    result.insert(record.symbol, data);
                }
                Err(e) => {
                    tracing::warn!(symbol = %record.symbol, error = %e, "Dropped snapshot record");
                }
            }
        }

        Ok(result)
    }

    /// Connection status of the push feed.
    #[must_use]
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.feed.status()
    }

    /// Restart the push feed after it went offline.
    pub fn reconnect(&self) {
        tracing::info!("Manual reconnect requested");
        self.inner.feed.reconnect();
    }

    /// Start the background tasks: feed ingest, debounced notifications,
    /// cache sweep and store eviction.
    pub fn start(
        &self,
        events: mpsc::Receiver<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_ingest(events, cancel.clone()),
            self.inner.store.spawn_notifier(cancel.clone()),
            self.inner.cache.spawn_sweeper(cancel.clone()),
            self.spawn_eviction(cancel.clone()),
        ]
    }

    /// Merge push-feed events into the store in arrival order.
    pub fn spawn_ingest(
        &self,
        mut events: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.inner.store);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if let StreamEvent::Status(status) = event {
                    tracing::info!(status = %status, "Feed status changed");
                    continue;
                }

                if let Err(e) = store.apply_feed_event(&event) {
                    metrics::record_malformed_message(event.kind());
                    tracing::warn!(kind = event.kind(), error = %e, "Dropped invalid feed event");
                }
            }
            tracing::debug!("Feed ingest stopped");
        })
    }

    /// Periodically evict stale unsubscribed records.
    pub fn spawn_eviction(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.inner.store);
        let period = self.inner.config.eviction_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        store.evict_stale();
                    }
                }
            }
        })
    }
}

impl Inner {
    /// Fresh store data, else a cache hit merged into the store.
    fn local(&self, symbol: &Symbol) -> Option<MarketData> {
        if let Some(data) = self.store.get_fresh(symbol, self.config.fresh_for) {
            return Some(data);
        }
        let patch = self
            .cache
            .get::<MarketDataPatch>(CacheNamespace::MarketData, symbol.as_str())?;
        match self.store.update(symbol, &patch, DataSource::Cache) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Discarding invalid cache entry");
                self.cache
                    .invalidate(CacheNamespace::MarketData, symbol.as_str());
                None
            }
        }
    }

    async fn seed(&self, symbol: &Symbol) -> SeedOutcome {
        let outcome = self.seed_from_sources(symbol).await;
        self.seeding.lock().remove(symbol);

        {
            let _interest = self.push_interest.lock();
            if self.store.has_subscribers(symbol) {
                self.feed.subscribe(std::slice::from_ref(symbol));
            }
        }

        match &outcome {
            SeedOutcome::Deferred(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Initial fetch deferred to push feed");
            }
            other => {
                tracing::debug!(symbol = %symbol, outcome = other.as_str(), "Symbol seeded");
            }
        }
        outcome
    }

    async fn seed_from_sources(&self, symbol: &Symbol) -> SeedOutcome {
        if self.store.get_fresh(symbol, self.config.fresh_for).is_some() {
            return SeedOutcome::Store;
        }
        if self.local(symbol).is_some() {
            return SeedOutcome::Cache;
        }

        if let Err(e) = self
            .limiter
            .wait_for_token(&self.config.rest_identity, self.config.max_wait)
            .await
        {
            return SeedOutcome::Deferred(ClientError::rate_limited(e, Some(symbol)));
        }

        let batch = match self.fetch(std::slice::from_ref(symbol)).await {
            Ok(batch) => batch,
            Err(e) => return SeedOutcome::Deferred(ClientError::from_snapshot(e, Some(symbol))),
        };

        let Some(record) = batch.get(symbol) else {
            return SeedOutcome::Deferred(ClientError::Upstream {
                message: "symbol missing from snapshot".to_string(),
                context: super::ErrorContext::new(Some(symbol), DataSource::Rest),
            });
        };

        match self.store.update(symbol, &record.patch, DataSource::Rest) {
            Ok(_) => SeedOutcome::Rest,
            Err(e) => SeedOutcome::Deferred(e.into()),
        }
    }

    async fn fetch(
        &self,
        symbols: &[Symbol],
    ) -> Result<crate::application::ports::SnapshotBatch, SnapshotError> {
        let result = self.rest.fetch_snapshots(symbols).await;
        match &result {
            Ok(batch) if batch.rejected > 0 => {
                tracing::warn!(rejected = batch.rejected, "Snapshot contained invalid tickers");
            }
            Err(SnapshotError::RateLimited { retry_after }) => {
                self.limiter
                    .block(&self.config.rest_identity, *retry_after);
            }
            Err(e) => {
                tracing::warn!(error = %e, symbols = symbols.len(), "Snapshot fetch failed");
            }
            Ok(_) => {}
        }
        result
    }

    fn release(&self, symbol: &Symbol, id: SubscriberId) {
        let _interest = self.push_interest.lock();
        if self.store.unsubscribe(symbol, id).was_last() {
            self.feed.unsubscribe(std::slice::from_ref(symbol));
            tracing::info!(symbol = %symbol, "Last subscriber left, push interest released");
        }
    }
}
