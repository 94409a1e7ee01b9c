//! Client Configuration Settings
//!
//! Configuration types for the market data client, loaded from environment
//! variables. Every tunable number used by the services lives here; tests
//! build these structs directly or go through [`ClientConfig::from_lookup`].

use std::time::Duration;

use crate::domain::market_data::{ReliabilityPolicy, StalenessTier};
use crate::infrastructure::feed::Channel;

/// Provider API key.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key.
    #[must_use]
    pub const fn new(key: String) -> Self {
        Self(key)
    }

    /// Get the key.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Push feed WebSocket URL.
    pub feed_url: String,
    /// REST API base URL.
    pub rest_url: String,
    /// Token endpoint; when unset the API key itself authenticates the feed.
    pub token_url: Option<String>,
    /// REST request timeout.
    pub rest_timeout: Duration,
    /// Token request timeout.
    pub token_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            feed_url: "wss://socket.polygon.io/stocks".to_string(),
            rest_url: "https://api.polygon.io".to_string(),
            token_url: None,
            rest_timeout: Duration::from_secs(10),
            token_timeout: Duration::from_secs(5),
        }
    }
}

/// REST rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Requests allowed per minute.
    pub requests_per_minute: u32,
    /// Bucket capacity.
    pub burst_size: u32,
    /// Longest a subscribe waits for a token.
    pub max_wait: Duration,
    /// Limiter identity used for REST calls.
    pub identity: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 5,
            burst_size: 5,
            max_wait: Duration::from_secs(10),
            identity: "rest".to_string(),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval; twice this without traffic forces a reconnect.
    pub heartbeat_interval: Duration,
    /// Time allowed between sending auth and receiving its result.
    pub auth_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter factor in `0.0..=1.0` applied to each delay.
    pub reconnect_jitter: f64,
    /// Reconnection attempts before going offline.
    pub max_reconnect_attempts: u32,
    /// Channels requested per symbol.
    pub channels: Vec<Channel>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 10,
            channels: Channel::ALL.to_vec(),
        }
    }
}

/// Subscription batching settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Symbols per subscribe frame.
    pub batch_size: usize,
    /// Gap between consecutive frames.
    pub batch_delay: Duration,
    /// Quiet period before the first frame of a burst.
    pub debounce: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_delay: Duration::from_millis(100),
            debounce: Duration::from_millis(50),
        }
    }
}

/// Cache TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Schema version appended to keys.
    pub schema_version: u32,
    /// Market data TTL (also the store freshness window).
    pub market_data_ttl: Duration,
    /// Company info TTL.
    pub company_info_ttl: Duration,
    /// News TTL.
    pub news_ttl: Duration,
    /// Rate-limit counter TTL.
    pub rate_limit_ttl: Duration,
    /// Background sweep period.
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
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

/// Reconciliation store settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    /// Notification coalescing window.
    pub notify_debounce: Duration,
    /// Age after which unsubscribed records are evicted.
    pub expiry: Duration,
    /// Eviction pass period.
    pub eviction_interval: Duration,
    /// Source base scores and staleness breakpoints.
    pub reliability: ReliabilityPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            notify_debounce: Duration::from_millis(50),
            expiry: Duration::from_secs(15 * 60),
            eviction_interval: Duration::from_secs(60),
            reliability: ReliabilityPolicy::default(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Provider API key.
    pub api_key: ApiKey,
    /// Provider endpoints.
    pub endpoints: EndpointSettings,
    /// REST rate limit.
    pub rate_limit: RateLimitSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Subscription batching.
    pub batching: BatchSettings,
    /// Cache TTLs.
    pub cache: CacheSettings,
    /// Store settings.
    pub store: StoreSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Symbols the binary subscribes to at startup.
    pub symbols: Vec<String>,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: ApiKey::new(api_key.into()),
            endpoints: EndpointSettings::default(),
            rate_limit: RateLimitSettings::default(),
            websocket: WebSocketSettings::default(),
            batching: BatchSettings::default(),
            cache: CacheSettings::default(),
            store: StoreSettings::default(),
            server: ServerSettings::default(),
            symbols: Vec::new(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or a value cannot
    /// be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let api_key = env
            .string("MARKET_DATA_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_DATA_API_KEY".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_DATA_API_KEY".to_string()));
        }

        let defaults = Self::with_api_key(api_key.clone());

        let endpoints = EndpointSettings {
            feed_url: env
                .string("MARKET_DATA_FEED_URL")
                .unwrap_or(defaults.endpoints.feed_url),
            rest_url: env
                .string("MARKET_DATA_REST_URL")
                .unwrap_or(defaults.endpoints.rest_url),
            token_url: env
                .string("MARKET_DATA_TOKEN_URL")
                .filter(|url| !url.trim().is_empty()),
            rest_timeout: env.secs("MARKET_DATA_REST_TIMEOUT_SECS", defaults.endpoints.rest_timeout)?,
            token_timeout: env.secs(
                "MARKET_DATA_TOKEN_TIMEOUT_SECS",
                defaults.endpoints.token_timeout,
            )?,
        };

        let rate_limit = RateLimitSettings {
            requests_per_minute: env.parse(
                "MARKET_DATA_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit.requests_per_minute,
            )?,
            burst_size: env.parse(
                "MARKET_DATA_RATE_LIMIT_BURST",
                env.parse(
                    "MARKET_DATA_RATE_LIMIT_PER_MINUTE",
                    defaults.rate_limit.burst_size,
                )?,
            )?,
            max_wait: env.secs(
                "MARKET_DATA_RATE_LIMIT_MAX_WAIT_SECS",
                defaults.rate_limit.max_wait,
            )?,
            identity: defaults.rate_limit.identity,
        };

        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs(
                "MARKET_DATA_HEARTBEAT_INTERVAL_SECS",
                defaults.websocket.heartbeat_interval,
            )?,
            auth_timeout: env.secs(
                "MARKET_DATA_AUTH_TIMEOUT_SECS",
                defaults.websocket.auth_timeout,
            )?,
            reconnect_delay_initial: env.millis(
                "MARKET_DATA_RECONNECT_DELAY_INITIAL_MS",
                defaults.websocket.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.secs(
                "MARKET_DATA_RECONNECT_DELAY_MAX_SECS",
                defaults.websocket.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "MARKET_DATA_RECONNECT_DELAY_MULTIPLIER",
                defaults.websocket.reconnect_delay_multiplier,
            )?,
            reconnect_jitter: env.parse(
                "MARKET_DATA_RECONNECT_JITTER",
                defaults.websocket.reconnect_jitter,
            )?,
            max_reconnect_attempts: env.parse(
                "MARKET_DATA_MAX_RECONNECT_ATTEMPTS",
                defaults.websocket.max_reconnect_attempts,
            )?,
            channels: match env.string("MARKET_DATA_CHANNELS") {
                Some(raw) => parse_channels(&raw)?,
                None => defaults.websocket.channels,
            },
        };

        let batching = BatchSettings {
            batch_size: env.parse("MARKET_DATA_BATCH_SIZE", defaults.batching.batch_size)?,
            batch_delay: env.millis("MARKET_DATA_BATCH_DELAY_MS", defaults.batching.batch_delay)?,
            debounce: env.millis("MARKET_DATA_BATCH_DEBOUNCE_MS", defaults.batching.debounce)?,
        };

        let cache = CacheSettings {
            schema_version: env.parse(
                "MARKET_DATA_CACHE_SCHEMA_VERSION",
                defaults.cache.schema_version,
            )?,
            market_data_ttl: env.secs(
                "MARKET_DATA_CACHE_MARKET_TTL_SECS",
                defaults.cache.market_data_ttl,
            )?,
            company_info_ttl: env.secs(
                "MARKET_DATA_CACHE_COMPANY_TTL_SECS",
                defaults.cache.company_info_ttl,
            )?,
            news_ttl: env.secs("MARKET_DATA_CACHE_NEWS_TTL_SECS", defaults.cache.news_ttl)?,
            rate_limit_ttl: env.secs(
                "MARKET_DATA_CACHE_RATE_LIMIT_TTL_SECS",
                defaults.cache.rate_limit_ttl,
            )?,
            sweep_interval: env.secs(
                "MARKET_DATA_CACHE_SWEEP_INTERVAL_SECS",
                defaults.cache.sweep_interval,
            )?,
        };

        let store = StoreSettings {
            notify_debounce: env.millis(
                "MARKET_DATA_NOTIFY_DEBOUNCE_MS",
                defaults.store.notify_debounce,
            )?,
            expiry: env.secs("MARKET_DATA_STORE_EXPIRY_SECS", defaults.store.expiry)?,
            eviction_interval: env.secs(
                "MARKET_DATA_STORE_EVICTION_INTERVAL_SECS",
                defaults.store.eviction_interval,
            )?,
            reliability: ReliabilityPolicy {
                push_base: env.parse(
                    "MARKET_DATA_RELIABILITY_PUSH",
                    defaults.store.reliability.push_base,
                )?,
                rest_base: env.parse(
                    "MARKET_DATA_RELIABILITY_REST",
                    defaults.store.reliability.rest_base,
                )?,
                cache_base: env.parse(
                    "MARKET_DATA_RELIABILITY_CACHE",
                    defaults.store.reliability.cache_base,
                )?,
                tiers: match env.string("MARKET_DATA_STALENESS_TIERS") {
                    Some(raw) => parse_tiers(&raw)?,
                    None => defaults.store.reliability.tiers,
                },
            },
        };

        let server = ServerSettings {
            health_port: env.parse("MARKET_DATA_HEALTH_PORT", defaults.server.health_port)?,
        };

        let symbols = env
            .string("MARKET_DATA_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            api_key: ApiKey::new(api_key),
            endpoints,
            rate_limit,
            websocket,
            batching,
            cache,
            store,
            server,
            symbols,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        };

        if self.rate_limit.requests_per_minute == 0 {
            return invalid("MARKET_DATA_RATE_LIMIT_PER_MINUTE", "0".to_string());
        }
        if self.batching.batch_size == 0 {
            return invalid("MARKET_DATA_BATCH_SIZE", "0".to_string());
        }
        if self.websocket.heartbeat_interval.is_zero() {
            return invalid("MARKET_DATA_HEARTBEAT_INTERVAL_SECS", "0".to_string());
        }
        if !(0.0..=1.0).contains(&self.websocket.reconnect_jitter) {
            return invalid(
                "MARKET_DATA_RECONNECT_JITTER",
                self.websocket.reconnect_jitter.to_string(),
            );
        }
        if self.websocket.reconnect_delay_multiplier < 1.0 {
            return invalid(
                "MARKET_DATA_RECONNECT_DELAY_MULTIPLIER",
                self.websocket.reconnect_delay_multiplier.to_string(),
            );
        }
        if self.websocket.channels.is_empty() {
            return invalid("MARKET_DATA_CHANNELS", String::new());
        }

        let policy = &self.store.reliability;
        for (key, base) in [
            ("MARKET_DATA_RELIABILITY_PUSH", policy.push_base),
            ("MARKET_DATA_RELIABILITY_REST", policy.rest_base),
            ("MARKET_DATA_RELIABILITY_CACHE", policy.cache_base),
        ] {
            if !(0.0..=1.0).contains(&base) {
                return invalid(key, base.to_string());
            }
        }
        if policy.tiers.is_empty() {
            return invalid("MARKET_DATA_STALENESS_TIERS", String::new());
        }
        // Tiers are searched in order, so ages must strictly ascend.
        for (index, tier) in policy.tiers.iter().enumerate() {
            let ascending = index == 0 || policy.tiers[index - 1].max_age < tier.max_age;
            if !ascending || !(0.0..=1.0).contains(&tier.factor) {
                return invalid(
                    "MARKET_DATA_STALENESS_TIERS",
                    format!("{}:{}", tier.max_age.as_millis(), tier.factor),
                );
            }
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse::<u64>(key, default).map(Duration::from_millis)
    }
}

fn parse_channels(raw: &str) -> Result<Vec<Channel>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            Channel::from_name(name).ok_or_else(|| ConfigError::InvalidValue {
                key: "MARKET_DATA_CHANNELS".to_string(),
                value: name.to_string(),
            })
        })
        .collect()
}

/// Parse `max_age_ms:factor` pairs, e.g. `1000:1.0,60000:0.9`.
fn parse_tiers(raw: &str) -> Result<Vec<StalenessTier>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let invalid = || ConfigError::InvalidValue {
                key: "MARKET_DATA_STALENESS_TIERS".to_string(),
                value: pair.to_string(),
            };
            let (age, factor) = pair.split_once(':').ok_or_else(invalid)?;
            let age: u64 = age.trim().parse().map_err(|_| invalid())?;
            let factor: f64 = factor.trim().parse().map_err(|_| invalid())?;
            Ok(StalenessTier::new(Duration::from_millis(age), factor))
        })
        .collect()
}
