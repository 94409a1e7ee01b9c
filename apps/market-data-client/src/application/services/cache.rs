//! Cache Store
//!
//! In-memory key/value store with per-entry TTL, tag-based bulk
//! invalidation and schema versioning.
//!
//! # Keys
//!
//! Callers address entries by `(namespace, key)`. The physical key is
//! `"{namespace}:{key}:v{schema_version}"`, so entries written under another
//! schema version are never found (a miss, not an error).
//!
//! # Expiry
//!
//! An entry is logically absent once `now - timestamp > ttl`. Reads treat
//! such an entry as a miss and delete it (lazy eviction); [`CacheStore::sweep_expired`]
//! applies the same predicate to entries nobody reads again.
//!
//! # Tags
//!
//! A reverse index (tag → keys) is maintained under the same lock as the
//! entries, so removal from both happens in one critical section.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::clock::SharedClock;
use crate::domain::market_data::DataSource;
use crate::infrastructure::metrics;

// =============================================================================
// Namespaces & Configuration
// =============================================================================

/// Data kinds sharing the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Per-symbol market data.
    MarketData,
    /// Company profile data.
    CompanyInfo,
    /// News items.
    News,
    /// Rate-limit counters.
    RateLimit,
}

impl CacheNamespace {
    /// Key prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market",
            Self::CompanyInfo => "company",
            Self::News => "news",
            Self::RateLimit => "ratelimit",
        }
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache TTLs and housekeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Schema version appended to every key.
    pub schema_version: u32,
    /// TTL for market data.
    pub market_data_ttl: Duration,
    /// TTL for company info.
    pub company_info_ttl: Duration,
    /// TTL for news.
    pub news_ttl: Duration,
    /// TTL for rate-limit counters.
    pub rate_limit_ttl: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            market_data_ttl: Duration::from_secs(60),
            company_info_ttl: Duration::from_secs(24 * 60 * 60),
            news_ttl: Duration::from_secs(5 * 60),
            rate_limit_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create configuration from `CacheSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::CacheSettings) -> Self {
        Self {
            schema_version: settings.schema_version,
            market_data_ttl: settings.market_data_ttl,
            company_info_ttl: settings.company_info_ttl,
            news_ttl: settings.news_ttl,
            rate_limit_ttl: settings.rate_limit_ttl,
            sweep_interval: settings.sweep_interval,
        }
    }

    /// Default TTL for a namespace.
    #[must_use]
    pub const fn ttl_for(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::MarketData => self.market_data_ttl,
            CacheNamespace::CompanyInfo => self.company_info_ttl,
            CacheNamespace::News => self.news_ttl,
            CacheNamespace::RateLimit => self.rate_limit_ttl,
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Stored payload with bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serialized payload.
    pub payload: serde_json::Value,
    /// Write instant.
    pub timestamp: Instant,
    /// Time to live from `timestamp`.
    pub ttl: Duration,
    /// Origin of the payload.
    pub source: DataSource,
    /// Schema version at write time.
    pub version: u32,
    /// Invalidation tags.
    pub tags: HashSet<String>,
}

impl CacheEntry {
    /// Expiry predicate shared by reads and the sweep.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > self.ttl
    }

    /// Time left before expiry.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        (self.timestamp + self.ttl).saturating_duration_since(now)
    }
}

/// Cache write failure.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Value could not be serialized.
    #[error("failed to serialize cache value: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl CacheState {
    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.remove(&key);
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }
}

// =============================================================================
// Cache Store
// =============================================================================

/// TTL cache with tag invalidation.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    clock: SharedClock,
    state: RwLock<CacheState>,
}

impl CacheStore {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Cache configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn physical_key(&self, namespace: CacheNamespace, key: &str) -> String {
        format!(
            "{}:{}:v{}",
            namespace.as_str(),
            key,
            self.config.schema_version
        )
    }

    /// Store a value with the namespace's default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialize`] if the value cannot be serialized.
    pub fn set<T: Serialize>(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &T,
        source: DataSource,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        self.set_with_ttl(
            namespace,
            key,
            value,
            self.config.ttl_for(namespace),
            source,
            tags,
        )
    }

    /// Store a value with an explicit TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialize`] if the value cannot be serialized.
    pub fn set_with_ttl<T: Serialize>(
        &self,
        namespace: CacheNamespace,
        key: &str,
        value: &T,
        ttl: Duration,
        source: DataSource,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_value(value)?;
        let entry = CacheEntry {
            payload,
            timestamp: self.clock.now(),
            ttl,
            source,
            version: self.config.schema_version,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        };

        self.state
            .write()
            .insert(self.physical_key(namespace, key), entry);
        Ok(())
    }

    /// Read a value. Expired, mismatched or undecodable entries are misses
    /// and are removed.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, namespace: CacheNamespace, key: &str) -> Option<T> {
        let physical = self.physical_key(namespace, key);
        let now = self.clock.now();

        let observed = {
            let state = self.state.read();
            let Some(entry) = state.entries.get(&physical) else {
                metrics::record_cache_lookup(namespace.as_str(), false);
                return None;
            };

            if !entry.is_expired(now) && entry.version == self.config.schema_version {
                match T::deserialize(&entry.payload) {
                    Ok(value) => {
                        metrics::record_cache_lookup(namespace.as_str(), true);
                        return Some(value);
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %physical,
                            error = %e,
                            "Cache entry does not match requested shape, dropping"
                        );
                    }
                }
            }
            entry.timestamp
        };

        let mut state = self.state.write();
        if state
            .entries
            .get(&physical)
            .is_some_and(|entry| entry.timestamp == observed)
        {
            state.remove(&physical);
            metrics::record_cache_evictions(namespace.as_str(), 1);
        }
        drop(state);

        metrics::record_cache_lookup(namespace.as_str(), false);
        None
    }

    /// Remove one entry. Returns true if it existed.
    pub fn invalidate(&self, namespace: CacheNamespace, key: &str) -> bool {
        let physical = self.physical_key(namespace, key);
        self.state.write().remove(&physical).is_some()
    }

    /// Remove every entry carrying `tag`. Returns the number removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut state = self.state.write();
        let Some(keys) = state.tag_index.remove(tag) else {
            return 0;
        };

        let removed = keys
            .iter()
            .filter(|key| state.remove(key).is_some())
            .count();
        drop(state);

        tracing::debug!(tag, removed, "Invalidated cache entries by tag");
        removed
    }

    /// Time left before an entry expires. `None` if absent or already expired.
    #[must_use]
    pub fn ttl_remaining(&self, namespace: CacheNamespace, key: &str) -> Option<Duration> {
        let physical = self.physical_key(namespace, key);
        let now = self.clock.now();
        self.state
            .read()
            .entries
            .get(&physical)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.remaining(now))
    }

    /// Evict every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        drop(state);

        if !expired.is_empty() {
            metrics::record_cache_evictions("sweep", expired.len() as u64);
            tracing::debug!(evicted = expired.len(), "Cache sweep complete");
        }
        expired.len()
    }

    /// Physically present entries (including expired ones not yet evicted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Keys currently indexed under `tag`.
    #[must_use]
    pub fn tagged(&self, tag: &str) -> usize {
        self.state.read().tag_index.get(tag).map_or(0, HashSet::len)
    }

    /// Spawn the periodic sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Cache sweeper cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        cache.sweep_expired();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Deserialize;

    use super::*;
    use crate::domain::clock::ManualClock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        employees: u32,
    }

    fn cache() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            market_data_ttl: Duration::from_secs(10),
            ..CacheConfig::default()
        };
        (CacheStore::new(config, clock.clone()), clock)
    }

    fn profile() -> Profile {
        Profile {
            name: "Apple".to_string(),
            employees: 160_000,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let (cache, _) = cache();
        cache
            .set(CacheNamespace::CompanyInfo, "AAPL", &profile(), DataSource::Rest, &[])
            .unwrap();

        assert_eq!(
            cache.get::<Profile>(CacheNamespace::CompanyInfo, "AAPL"),
            Some(profile())
        );
    }

    #[test]
    fn namespaces_do_not_collide() {
        let (cache, _) = cache();
        cache
            .set(CacheNamespace::News, "AAPL", &"headline", DataSource::Rest, &[])
            .unwrap();

        assert_eq!(cache.get::<String>(CacheNamespace::MarketData, "AAPL"), None);
        assert_eq!(
            cache.get::<String>(CacheNamespace::News, "AAPL").as_deref(),
            Some("headline")
        );
    }

    #[test]
    fn expired_get_is_miss_and_evicts() {
        let (cache, clock) = cache();
        cache
            .set(CacheNamespace::MarketData, "AAPL", &1_u32, DataSource::Push, &["AAPL"])
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "AAPL"), Some(1));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "AAPL"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.tagged("AAPL"), 0);
    }

    #[test]
    fn sweep_uses_same_predicate_as_reads() {
        let (cache, clock) = cache();
        cache
            .set(CacheNamespace::MarketData, "OLD", &1_u32, DataSource::Rest, &[])
            .unwrap();
        clock.advance(Duration::from_secs(5));
        cache
            .set(CacheNamespace::MarketData, "NEW", &2_u32, DataSource::Rest, &[])
            .unwrap();

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "NEW"), Some(2));
    }

    #[test]
    fn invalidate_by_tag_removes_exactly_tagged_entries() {
        let (cache, _) = cache();
        cache
            .set(CacheNamespace::MarketData, "AAPL", &1_u32, DataSource::Rest, &["AAPL", "tech"])
            .unwrap();
        cache
            .set(CacheNamespace::News, "AAPL-1", &"a", DataSource::Rest, &["AAPL"])
            .unwrap();
        cache
            .set(CacheNamespace::MarketData, "MSFT", &2_u32, DataSource::Rest, &["MSFT", "tech"])
            .unwrap();

        assert_eq!(cache.invalidate_by_tag("AAPL"), 2);
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "AAPL"), None);
        assert_eq!(cache.get::<String>(CacheNamespace::News, "AAPL-1"), None);
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "MSFT"), Some(2));
        assert_eq!(cache.tagged("tech"), 1);

        assert_eq!(cache.invalidate_by_tag("AAPL"), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overwrite_replaces_tag_membership() {
        let (cache, _) = cache();
        cache
            .set(CacheNamespace::MarketData, "AAPL", &1_u32, DataSource::Rest, &["old"])
            .unwrap();
        cache
            .set(CacheNamespace::MarketData, "AAPL", &2_u32, DataSource::Push, &["new"])
            .unwrap();

        assert_eq!(cache.invalidate_by_tag("old"), 0);
        assert_eq!(cache.tagged("new"), 1);
        assert_eq!(cache.get::<u32>(CacheNamespace::MarketData, "AAPL"), Some(2));
    }

    #[test]
    fn schema_version_mismatch_is_a_miss() {
        let clock = Arc::new(ManualClock::new());
        let v1 = CacheStore::new(CacheConfig::default(), clock.clone());
        v1.set(CacheNamespace::CompanyInfo, "AAPL", &profile(), DataSource::Rest, &[])
            .unwrap();

        let v2 = CacheStore::new(
            CacheConfig {
                schema_version: 2,
                ..CacheConfig::default()
            },
            clock,
        );
        // Carry the v1 state over, as if the process had been redeployed.
        std::mem::swap(&mut *v2.state.write(), &mut *v1.state.write());

        assert_eq!(v2.get::<Profile>(CacheNamespace::CompanyInfo, "AAPL"), None);
        assert_eq!(v2.len(), 1);
    }

    #[test]
    fn incompatible_shape_is_a_miss_and_dropped() {
        let (cache, _) = cache();
        cache
            .set(CacheNamespace::CompanyInfo, "AAPL", &"just a string", DataSource::Rest, &[])
            .unwrap();

        assert_eq!(cache.get::<Profile>(CacheNamespace::CompanyInfo, "AAPL"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn ttl_remaining_counts_down() {
        let (cache, clock) = cache();
        cache
            .set_with_ttl(
                CacheNamespace::RateLimit,
                "rest",
                &3_u32,
                Duration::from_secs(30),
                DataSource::Rest,
                &[],
            )
            .unwrap();

        clock.advance(Duration::from_secs(12));
        assert_eq!(
            cache.ttl_remaining(CacheNamespace::RateLimit, "rest"),
            Some(Duration::from_secs(18))
        );

        clock.advance(Duration::from_secs(19));
        assert_eq!(cache.ttl_remaining(CacheNamespace::RateLimit, "rest"), None);
        assert!(cache.invalidate(CacheNamespace::RateLimit, "rest"));
        assert!(!cache.invalidate(CacheNamespace::RateLimit, "rest"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_in_background() {
        let clock = crate::domain::clock::SystemClock::shared();
        let cache = Arc::new(CacheStore::new(
            CacheConfig {
                market_data_ttl: Duration::from_secs(1),
                sweep_interval: Duration::from_secs(5),
                ..CacheConfig::default()
            },
            clock,
        ));
        cache
            .set(CacheNamespace::MarketData, "AAPL", &1_u32, DataSource::Rest, &[])
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
