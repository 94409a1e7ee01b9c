//! Subscription Batcher
//!
//! Coalesces subscribe requests into frames of at most `batch_size`
//! symbols. A burst is held for `debounce` after its first request; when a
//! backlog exceeds one batch, successive frames are spaced `batch_delay`
//! apart.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::market_data::Symbol;

/// Batching limits.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum symbols per frame.
    pub batch_size: usize,
    /// Gap between consecutive frames.
    pub batch_delay: Duration,
    /// Coalescing window for a burst.
    pub debounce: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_delay: Duration::from_millis(100),
            debounce: Duration::from_millis(50),
        }
    }
}

impl BatchConfig {
    /// Create configuration from `BatchSettings`.
    #[must_use]
    pub const fn from_settings(settings: &crate::BatchSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            batch_delay: settings.batch_delay,
            debounce: settings.debounce,
        }
    }
}

/// Pending subscription queue.
#[derive(Debug)]
pub struct SubscriptionBatcher {
    config: BatchConfig,
    pending: BTreeSet<Symbol>,
    ready_at: Option<Instant>,
}

impl SubscriptionBatcher {
    /// Create an empty batcher.
    #[must_use]
    pub const fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: BTreeSet::new(),
            ready_at: None,
        }
    }

    /// Queue symbols. Opens a debounce window if none is pending.
    pub fn enqueue<'a, I>(&mut self, symbols: I, now: Instant)
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        let before = self.pending.len();
        self.pending.extend(symbols.into_iter().cloned());
        if self.pending.len() > before && self.ready_at.is_none() {
            self.ready_at = Some(now + self.config.debounce);
        }
    }

    /// Drop a queued symbol.
    pub fn remove(&mut self, symbol: &Symbol) -> bool {
        let removed = self.pending.remove(symbol);
        if self.pending.is_empty() {
            self.ready_at = None;
        }
        removed
    }

    /// Take the next batch if its time has come.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<Symbol>> {
        let ready_at = self.ready_at?;
        if now < ready_at {
            return None;
        }

        let size = self.config.batch_size.max(1);
        let batch: Vec<Symbol> = self.pending.iter().take(size).cloned().collect();
        for symbol in &batch {
            self.pending.remove(symbol);
        }

        self.ready_at = if self.pending.is_empty() {
            None
        } else {
            Some(now + self.config.batch_delay)
        };

        if batch.is_empty() { None } else { Some(batch) }
    }

    /// When the next batch becomes due.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        self.ready_at
    }

    /// Discard everything queued.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.ready_at = None;
    }

    /// Queued symbol count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(n: usize) -> Vec<Symbol> {
        (0..n)
            .map(|i| Symbol::new(&format!("S{i:02}")).unwrap())
            .collect()
    }

    fn batcher() -> SubscriptionBatcher {
        SubscriptionBatcher::new(BatchConfig {
            batch_size: 20,
            batch_delay: Duration::from_millis(100),
            debounce: Duration::from_millis(50),
        })
    }

    #[test]
    fn burst_waits_for_debounce() {
        let mut b = batcher();
        let start = Instant::now();
        let syms = symbols(3);

        b.enqueue(&syms[..1], start);
        b.enqueue(&syms[1..], start + Duration::from_millis(30));

        assert!(b.poll(start + Duration::from_millis(49)).is_none());
        let batch = b.poll(start + Duration::from_millis(50)).unwrap();
        assert_eq!(batch, syms);
        assert!(b.is_empty());
        assert!(b.next_deadline().is_none());
    }

    #[test]
    fn forty_five_symbols_become_three_spaced_frames() {
        let mut b = batcher();
        let start = Instant::now();
        b.enqueue(&symbols(45), start);

        let t0 = start + Duration::from_millis(50);
        assert_eq!(b.poll(t0).unwrap().len(), 20);
        assert!(b.poll(t0 + Duration::from_millis(99)).is_none());

        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(b.poll(t1).unwrap().len(), 20);

        let t2 = t1 + Duration::from_millis(100);
        assert_eq!(b.poll(t2).unwrap().len(), 5);
        assert!(b.poll(t2 + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn duplicates_collapse_and_removal_cancels() {
        let mut b = batcher();
        let start = Instant::now();
        let syms = symbols(2);

        b.enqueue(&syms, start);
        b.enqueue(&syms, start);
        assert_eq!(b.len(), 2);

        assert!(b.remove(&syms[0]));
        assert!(b.remove(&syms[1]));
        assert!(b.next_deadline().is_none());
        assert!(b.poll(start + Duration::from_secs(1)).is_none());
    }
}
