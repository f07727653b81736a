//! Sliding-window rate limiting
//!
//! Keyed limiter (one window per key) used to cap outbound sends per channel.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sase_common::SharedClock;
use std::collections::VecDeque;

/// Single sliding window
pub struct SlidingWindow {
    window: Duration,
    max_requests: u64,
    requests: Mutex<VecDeque<DateTime<Utc>>>,
}

impl SlidingWindow {
    /// Window admitting `max_requests` per `window`
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to record a request at `now`
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut requests = self.requests.lock();
        let cutoff = now - self.window;

        while requests.front().map_or(false, |t| *t <= cutoff) {
            requests.pop_front();
        }

        if (requests.len() as u64) < self.max_requests {
            requests.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests still available at `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> u64 {
        let requests = self.requests.lock();
        let cutoff = now - self.window;
        let active = requests.iter().filter(|t| **t > cutoff).count() as u64;
        self.max_requests.saturating_sub(active)
    }

    /// When the oldest request leaves the window
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.requests.lock().front().map(|t| *t + self.window)
    }
}

/// One sliding window per key, created on first use
pub struct KeyedRateLimiter {
    window: Duration,
    clock: SharedClock,
    windows: DashMap<String, (u64, SlidingWindow)>,
}

impl KeyedRateLimiter {
    /// Limiter whose per-key windows span `window`
    pub fn new(window: Duration, clock: SharedClock) -> Self {
        Self {
            window,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Record a request for `key` against a ceiling of `limit` per window.
    /// A changed limit replaces the key's window.
    pub fn try_acquire(&self, key: &str, limit: u64) -> bool {
        let now = self.clock.now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| (limit, SlidingWindow::new(self.window, limit)));

        if entry.0 != limit {
            *entry = (limit, SlidingWindow::new(self.window, limit));
        }
        entry.1.try_acquire(now)
    }

    /// Requests left for `key`, if it has been seen
    pub fn remaining(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.windows.get(key).map(|w| w.1.remaining(now))
    }

    /// Forget every window
    pub fn clear(&self) {
        self.windows.clear();
    }
}
