//! Token-Bucket Rate Limiter
//!
//! Bounds the request rate against the upstream REST API per caller
//! identity. Independent of networking.
//!
//! # Algorithm
//!
//! Each identity owns a bucket holding up to `burst_size` tokens. Tokens are
//! added in whole intervals: `floor(elapsed / interval) * tokens_per_interval`,
//! capped at `burst_size`, with `last_refill` advanced by the number of whole
//! intervals consumed so refill boundaries stay aligned.
//!
//! An upstream 429 opens a block window on the bucket that denies requests
//! regardless of the token count until it expires.
//!
//! # Concurrency
//!
//! Buckets live in a [`DashMap`]; every refill-and-consume happens while
//! holding the bucket's shard guard, so one critical section per call.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::domain::clock::SharedClock;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Tokens added per refill interval.
    pub tokens_per_interval: u32,
    /// Refill interval.
    pub interval: Duration,
    /// Bucket capacity.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_interval(5, Duration::from_secs(60))
    }
}

impl RateLimitConfig {
    /// Bucket whose burst equals the per-interval rate.
    #[must_use]
    pub const fn per_interval(tokens_per_interval: u32, interval: Duration) -> Self {
        Self {
            tokens_per_interval,
            interval,
            burst_size: tokens_per_interval,
        }
    }

    /// Override the burst size.
    #[must_use]
    pub const fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    /// Create configuration from `RateLimitSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::RateLimitSettings) -> Self {
        Self {
            tokens_per_interval: settings.requests_per_minute,
            interval: Duration::from_secs(60),
            burst_size: settings.burst_size,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of a non-blocking consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Whether a token was taken.
    pub allowed: bool,
    /// Time until a retry could succeed (zero when allowed).
    pub retry_after: Duration,
    /// Tokens left after this call.
    pub remaining: f64,
}

/// Rate limiter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// No token became available within the caller's wait budget.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    Exhausted {
        /// Time until the next token.
        retry_after: Duration,
    },
}

impl RateLimitError {
    /// Suggested wait before retrying.
    #[must_use]
    pub const fn retry_after(&self) -> Duration {
        match self {
            Self::Exhausted { retry_after } => *retry_after,
        }
    }
}

// =============================================================================
// Bucket
// =============================================================================

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.burst_size),
            last_refill: now,
            blocked_until: None,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let interval = config.interval.as_nanos();
        if interval == 0 {
            self.tokens = f64::from(config.burst_size);
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let intervals = elapsed / interval;
        if intervals == 0 {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let added = intervals as f64 * f64::from(config.tokens_per_interval);
        self.tokens = (self.tokens + added).min(f64::from(config.burst_size));

        let advance = u32::try_from(intervals).map_or(Duration::MAX, |n| config.interval * n);
        self.last_refill = self
            .last_refill
            .checked_add(advance)
            .unwrap_or(now)
            .min(now);

        if let Some(until) = self.blocked_until
            && until <= now
        {
            self.blocked_until = None;
        }
    }

    fn until_next_refill(&self, config: &RateLimitConfig, now: Instant) -> Duration {
        (self.last_refill + config.interval).saturating_duration_since(now)
    }

    fn consume(&mut self, config: &RateLimitConfig, now: Instant) -> RateDecision {
        self.refill(config, now);

        if let Some(until) = self.blocked_until {
            if until > now {
                return RateDecision {
                    allowed: false,
                    retry_after: until - now,
                    remaining: self.tokens,
                };
            }
            self.blocked_until = None;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision {
                allowed: true,
                retry_after: Duration::ZERO,
                remaining: self.tokens,
            };
        }

        RateDecision {
            allowed: false,
            retry_after: self.until_next_refill(config, now),
            remaining: self.tokens,
        }
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-identity token buckets.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Bucket parameters.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to take a token without waiting.
    pub fn consume(&self, identity: &str) -> RateDecision {
        let now = self.clock.now();
        let decision = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::full(&self.config, now))
            .consume(&self.config, now);

        if !decision.allowed {
            metrics::record_rate_limited(identity);
            tracing::debug!(
                identity,
                retry_after_ms = decision.retry_after.as_millis(),
                "Rate limit denied request"
            );
        }
        decision
    }

    /// Tokens currently available, after refill.
    #[must_use]
    pub fn inspect(&self, identity: &str) -> f64 {
        let now = self.clock.now();
        self.buckets.get_mut(identity).map_or_else(
            || f64::from(self.config.burst_size),
            |mut bucket| {
                bucket.refill(&self.config, now);
                bucket.tokens
            },
        )
    }

    /// Wait until a token is available, bounded by `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exhausted`] as soon as the next token is
    /// further away than the remaining wait budget. Never waits longer than
    /// `max_wait` in total.
    pub async fn wait_for_token(
        &self,
        identity: &str,
        max_wait: Duration,
    ) -> Result<(), RateLimitError> {
        let mut budget = max_wait;
        loop {
            let decision = self.consume(identity);
            if decision.allowed {
                return Ok(());
            }
            if decision.retry_after > budget || decision.retry_after.is_zero() {
                return Err(RateLimitError::Exhausted {
                    retry_after: decision.retry_after,
                });
            }

            tracing::debug!(
                identity,
                wait_ms = decision.retry_after.as_millis(),
                "Waiting for rate limit token"
            );
            tokio::time::sleep(decision.retry_after).await;
            budget = budget.saturating_sub(decision.retry_after);
        }
    }

    /// Deny all requests for `identity` for `duration` (upstream 429).
    pub fn block(&self, identity: &str, duration: Duration) {
        let now = self.clock.now();
        let until = now + duration;
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket::full(&self.config, now));
        bucket.blocked_until = Some(bucket.blocked_until.map_or(until, |b| b.max(until)));

        tracing::warn!(
            identity,
            block_ms = duration.as_millis(),
            "Upstream rate limit, blocking requests"
        );
    }

    /// Remaining block window for an identity, if any.
    #[must_use]
    pub fn blocked_for(&self, identity: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.buckets
            .get(identity)
            .and_then(|bucket| bucket.blocked_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}
