//! Fixed-window rate limiting keyed by an arbitrary string (the sending account).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// `max` claims per `window` for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_second(max: u32) -> Self {
        Self {
            max,
            window: Duration::from_secs(1),
        }
    }

    fn window_ms(&self) -> i64 {
        (self.window.as_millis() as i64).max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_ms: i64,
    used: u32,
}

/// Per-key fixed-window counters.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: RateLimit,
    windows: HashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            windows: HashMap::new(),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take one slot for `key` if the current window has room.
    pub fn try_acquire(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let window_ms = self.limit.window_ms();
        let start = now_ms - now_ms.rem_euclid(window_ms);

        let window = self.windows.entry(key.to_string()).or_insert(Window {
            started_ms: start,
            used: 0,
        });
        if window.started_ms != start {
            *window = Window {
                started_ms: start,
                used: 0,
            };
        }
        if window.used >= self.limit.max {
            return false;
        }
        window.used += 1;
        true
    }

    /// Drop windows that ended before `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let window_ms = self.limit.window_ms();
        self.windows.retain(|_, w| w.started_ms + window_ms > now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_caps_each_key_independently() {
        let mut limiter = FixedWindowLimiter::new(RateLimit::per_second(2));
        let now = DateTime::from_timestamp_millis(10_000).unwrap();

        assert!(limiter.try_acquire("a", now));
        assert!(limiter.try_acquire("a", now));
        assert!(!limiter.try_acquire("a", now));
        assert!(limiter.try_acquire("b", now));

        let next = DateTime::from_timestamp_millis(11_000).unwrap();
        assert!(limiter.try_acquire("a", next));
    }

    #[test]
    fn prune_keeps_current_windows() {
        let mut limiter = FixedWindowLimiter::new(RateLimit::per_second(1));
        let now = DateTime::from_timestamp_millis(10_500).unwrap();
        limiter.try_acquire("a", now);
        limiter.prune(now);
        assert!(!limiter.try_acquire("a", now));

        limiter.prune(DateTime::from_timestamp_millis(12_000).unwrap());
        assert!(limiter.windows.is_empty());
    }
}
