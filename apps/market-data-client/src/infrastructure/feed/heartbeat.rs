//! Heartbeat Watchdog
//!
//! Tracks inbound activity on the push feed connection. A ping is due every
//! `ping_interval`; if nothing at all (data, status, pong) arrives for
//! `timeout` the connection is considered dead.

use std::time::Duration;

use tokio::time::Instant;

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is dropped.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_interval(Duration::from_secs(30))
    }
}

impl HeartbeatConfig {
    /// Ping every `interval`; time out after two silent intervals.
    #[must_use]
    pub fn from_interval(interval: Duration) -> Self {
        Self {
            ping_interval: interval,
            timeout: interval.saturating_mul(2),
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self::from_interval(settings.heartbeat_interval)
    }
}

/// Watchdog action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping.
    SendPing,
    /// Connection is silent past the timeout.
    Timeout,
}

/// Per-connection watchdog state.
#[derive(Debug)]
pub struct HeartbeatState {
    config: HeartbeatConfig,
    last_activity: Instant,
    next_ping: Instant,
}

impl HeartbeatState {
    /// Start watching a connection opened at `now`.
    #[must_use]
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        let next_ping = now + config.ping_interval;
        Self {
            config,
            last_activity: now,
            next_ping,
        }
    }

    /// Record any inbound frame.
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time of the silence deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.config.timeout
    }

    /// Earliest instant at which [`Self::poll`] may return an event.
    #[must_use]
    pub fn next_wakeup(&self) -> Instant {
        self.next_ping.min(self.deadline())
    }

    /// Evaluate the watchdog at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatEvent> {
        if now >= self.deadline() {
            return Some(HeartbeatEvent::Timeout);
        }
        if now >= self.next_ping {
            self.next_ping = now + self.config.ping_interval;
            return Some(HeartbeatEvent::SendPing);
        }
        None
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (HeartbeatState, Instant) {
        let now = Instant::now();
        (
            HeartbeatState::new(HeartbeatConfig::from_interval(Duration::from_secs(10)), now),
            now,
        )
    }

    #[test]
    fn pings_on_interval() {
        let (mut hb, start) = state();
        assert_eq!(hb.poll(start + Duration::from_secs(5)), None);
        assert_eq!(
            hb.poll(start + Duration::from_secs(10)),
            Some(HeartbeatEvent::SendPing)
        );
        assert_eq!(hb.poll(start + Duration::from_secs(11)), None);
        assert_eq!(hb.next_wakeup(), start + Duration::from_secs(20));
    }

    #[test]
    fn silence_past_two_intervals_times_out() {
        let (mut hb, start) = state();
        let _ = hb.poll(start + Duration::from_secs(10));
        assert_eq!(
            hb.poll(start + Duration::from_secs(20)),
            Some(HeartbeatEvent::Timeout)
        );
    }

    #[test]
    fn activity_pushes_the_deadline() {
        let (mut hb, start) = state();
        hb.record_activity(start + Duration::from_secs(15));
        assert_eq!(hb.deadline(), start + Duration::from_secs(35));
        assert_eq!(
            hb.poll(start + Duration::from_secs(21)),
            Some(HeartbeatEvent::SendPing)
        );
        assert_eq!(hb.idle_for(start + Duration::from_secs(21)), Duration::from_secs(6));
    }
}
