//! Pacing primitives: the global sliding rate window and per-entity cooldowns.
//!
//! Both take the current instant as an argument so callers decide which
//! clock drives them (wall clock in production, virtual time in tests).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Sliding window over the send times of every simulated entity.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    /// `None` when rate limiting is disabled.
    max: Option<usize>,
    sends: VecDeque<Instant>,
}

impl RateWindow {
    /// Create a window from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            max: config.enabled.then_some(config.max_messages),
            sends: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sends.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another send right now would exceed the cap.
    pub fn is_limited(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.max.is_some_and(|max| self.sends.len() >= max)
    }

    /// Record a send that actually happened.
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.sends.push_back(now);
    }

    /// Sends currently inside the window.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.sends.len()
    }

    /// Time until the oldest send leaves the window, if limited.
    pub fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        if !self.is_limited(now) {
            return None;
        }
        Some(self.sends.front().map_or(self.window, |oldest| {
            self.window.saturating_sub(now.saturating_duration_since(*oldest))
        }))
    }
}

/// Minimum interval between two messages of the same entity.
#[derive(Debug, Clone)]
pub struct Cooldowns {
    interval: Duration,
    last_sent: HashMap<String, Instant>,
}

impl Cooldowns {
    /// Create cooldown tracking with the given per-entity interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
        }
    }

    /// Time the entity must still wait before it may speak.
    #[must_use]
    pub fn remaining(&self, entity: &str, now: Instant) -> Duration {
        self.last_sent.get(entity).map_or(Duration::ZERO, |last| {
            self.interval
                .saturating_sub(now.saturating_duration_since(*last))
        })
    }

    /// Whether the entity is still cooling down.
    #[must_use]
    pub fn is_cooling(&self, entity: &str, now: Instant) -> bool {
        !self.remaining(entity, now).is_zero()
    }

    /// Record that the entity just spoke.
    pub fn record(&mut self, entity: &str, now: Instant) {
        self.last_sent.insert(entity.to_string(), now);
    }

    /// Forget an entity (roster removal).
    pub fn forget(&mut self, entity: &str) {
        self.last_sent.remove(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(max: usize, secs: u64) -> RateWindow {
        RateWindow::new(&RateLimitConfig {
            enabled: true,
            window_secs: secs,
            max_messages: max,
        })
    }

    #[test]
    fn limited_after_max_sends() {
        let start = Instant::now();
        let mut w = window(3, 60);
        for i in 0..3 {
            assert!(!w.is_limited(start + Duration::from_secs(i)));
            w.record(start + Duration::from_secs(i));
        }
        assert!(w.is_limited(start + Duration::from_secs(10)));
    }

    #[test]
    fn capacity_restored_one_at_a_time() {
        let start = Instant::now();
        let mut w = window(2, 60);
        w.record(start);
        w.record(start + Duration::from_secs(5));
        assert!(w.is_limited(start + Duration::from_secs(59)));

        // The first send leaves the window: exactly one slot opens.
        let later = start + Duration::from_secs(60);
        assert!(!w.is_limited(later));
        w.record(later);
        assert!(w.is_limited(later));
    }

    #[test]
    fn disabled_window_never_limits() {
        let now = Instant::now();
        let mut w = RateWindow::new(&RateLimitConfig {
            enabled: false,
            window_secs: 60,
            max_messages: 0,
        });
        for _ in 0..100 {
            w.record(now);
        }
        assert!(!w.is_limited(now));
    }

    #[test]
    fn retry_after_points_at_oldest() {
        let start = Instant::now();
        let mut w = window(1, 30);
        w.record(start);
        let wait = w.retry_after(start + Duration::from_secs(10));
        assert_eq!(wait, Some(Duration::from_secs(20)));
    }

    #[test]
    fn cooldown_remaining_counts_down() {
        let start = Instant::now();
        let mut c = Cooldowns::new(Duration::from_secs(8));
        assert!(!c.is_cooling("steve", start));
        c.record("steve", start);
        assert_eq!(c.remaining("steve", start + Duration::from_secs(3)), Duration::from_secs(5));
        assert!(!c.is_cooling("steve", start + Duration::from_secs(8)));
        assert!(!c.is_cooling("luna", start));
    }
}
