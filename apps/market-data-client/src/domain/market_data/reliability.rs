//! Reliability Scoring
//!
//! `reliability = base(source) * factor(staleness)`. Base values and the
//! staleness breakpoints are policy, not protocol, so both are configurable.

use std::time::Duration;

use super::DataSource;

/// Staleness bucket: data younger than `max_age` keeps `factor` of its base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StalenessTier {
    /// Exclusive upper bound of the bucket.
    pub max_age: Duration,
    /// Multiplier applied to the source base.
    pub factor: f64,
}

impl StalenessTier {
    /// Create a tier.
    #[must_use]
    pub const fn new(max_age: Duration, factor: f64) -> Self {
        Self { max_age, factor }
    }
}

/// Source base scores and staleness decay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityPolicy {
    /// Base score for push-feed data.
    pub push_base: f64,
    /// Base score for REST snapshots.
    pub rest_base: f64,
    /// Base score for cache hits.
    pub cache_base: f64,
    /// Ascending buckets; anything older than the last bucket scores zero.
    pub tiers: Vec<StalenessTier>,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self {
            push_base: 1.0,
            rest_base: 0.9,
            cache_base: 0.8,
            tiers: vec![
                StalenessTier::new(Duration::from_secs(1), 1.0),
                StalenessTier::new(Duration::from_secs(60), 0.9),
                StalenessTier::new(Duration::from_secs(5 * 60), 0.7),
                StalenessTier::new(Duration::from_secs(15 * 60), 0.5),
            ],
        }
    }
}

impl ReliabilityPolicy {
    /// Base score for a source.
    #[must_use]
    pub const fn base(&self, source: DataSource) -> f64 {
        match source {
            DataSource::Push => self.push_base,
            DataSource::Rest => self.rest_base,
            DataSource::Cache => self.cache_base,
        }
    }

    /// Decay multiplier for an age.
    #[must_use]
    pub fn decay(&self, staleness: Duration) -> f64 {
        self.tiers
            .iter()
            .find(|tier| staleness < tier.max_age)
            .map_or(0.0, |tier| tier.factor)
    }

    /// Reliability in `0.0..=1.0`.
    #[must_use]
    pub fn score(&self, source: DataSource, staleness: Duration) -> f64 {
        (self.base(source) * self.decay(staleness)).clamp(0.0, 1.0)
    }

    /// Age past which every source scores zero.
    #[must_use]
    pub fn horizon(&self) -> Duration {
        self.tiers.last().map_or(Duration::ZERO, |tier| tier.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DataSource::Push, 500, 1.0 ; "push at half a second keeps full base")]
    #[test_case(DataSource::Push, 20 * 60 * 1000, 0.0 ; "push at twenty minutes is worthless")]
    #[test_case(DataSource::Rest, 0, 0.9 ; "fresh rest")]
    #[test_case(DataSource::Cache, 0, 0.8 ; "fresh cache")]
    #[test_case(DataSource::Push, 30_000, 0.9 ; "push under a minute")]
    #[test_case(DataSource::Rest, 2 * 60 * 1000, 0.63 ; "rest under five minutes")]
    #[test_case(DataSource::Cache, 10 * 60 * 1000, 0.4 ; "cache under fifteen minutes")]
    #[test_case(DataSource::Rest, 15 * 60 * 1000, 0.0 ; "exactly fifteen minutes is past the last tier")]
    fn default_policy_scores(source: DataSource, staleness_ms: u64, expected: f64) {
        let policy = ReliabilityPolicy::default();
        let score = policy.score(source, Duration::from_millis(staleness_ms));
        assert!(
            (score - expected).abs() < 1e-9,
            "expected {expected}, got {score}"
        );
    }

    #[test]
    fn custom_breakpoints_are_honoured() {
        let policy = ReliabilityPolicy {
            push_base: 0.5,
            rest_base: 0.5,
            cache_base: 0.5,
            tiers: vec![StalenessTier::new(Duration::from_secs(10), 1.0)],
        };

        assert!((policy.score(DataSource::Push, Duration::from_secs(9)) - 0.5).abs() < 1e-9);
        assert!(policy.score(DataSource::Push, Duration::from_secs(10)).abs() < 1e-9);
        assert_eq!(policy.horizon(), Duration::from_secs(10));
    }
}
