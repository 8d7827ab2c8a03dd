//! Fixed window counter.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Configuration for a [`FixedWindowCounter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Requests allowed per window (see [`FixedWindowCounter::allow`] for the
    /// exact threshold)
    #[serde(default = "default_rate")]
    pub rate: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_rate() -> u64 {
    3
}

fn default_window_ms() -> u64 {
    1000
}

impl FixedWindowConfig {
    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

struct CounterState {
    rate: u64,
    begin: Instant,
    window: Duration,
    count: u64,
}

/// A counter that admits requests until its threshold and then waits for the
/// window that began at `begin` to elapse.
///
/// The threshold is `rate - 1`: while `count + 1 < rate` a request is admitted
/// and counted. Past that, a request is admitted only if the window has
/// elapsed, which resets `begin` to now and `count` to zero without counting
/// the admitting request itself.
pub struct FixedWindowCounter {
    state: Mutex<CounterState>,
}

impl FixedWindowCounter {
    /// Create a counter whose first window starts now.
    pub fn new(rate: u64, window: Duration) -> Self {
        Self::starting_at(rate, window, Instant::now())
    }

    /// Create a counter whose first window starts at `begin`.
    pub fn starting_at(rate: u64, window: Duration, begin: Instant) -> Self {
        Self {
            state: Mutex::new(CounterState {
                rate,
                begin,
                window,
                count: 0,
            }),
        }
    }

    /// Create a counter from configuration.
    pub fn from_config(config: &FixedWindowConfig) -> Self {
        Self::new(config.rate, config.window())
    }

    /// Reconfigure the counter and start a fresh window now.
    pub fn set(&self, rate: u64, window: Duration) {
        let mut state = self.state.lock();
        state.rate = rate;
        state.window = window;
        state.begin = Instant::now();
        state.count = 0;
    }

    /// Start a fresh window at `at`.
    pub fn reset(&self, at: Instant) {
        let mut state = self.state.lock();
        state.begin = at;
        state.count = 0;
    }

    /// Decide whether a request may proceed now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Decide whether a request may proceed at `now`.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        if state.count + 1 < state.rate {
            state.count += 1;
            trace!(count = state.count, rate = state.rate, "Fixed window admit");
            return true;
        }

        let elapsed = now.saturating_duration_since(state.begin);
        if elapsed >= state.window {
            state.begin = now;
            state.count = 0;
            debug!(rate = state.rate, "Fixed window reset");
            true
        } else {
            false
        }
    }

    /// Requests counted in the current window.
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// The configured rate.
    pub fn rate(&self) -> u64 {
        self.state.lock().rate
    }

    /// The configured window length.
    pub fn window(&self) -> Duration {
        self.state.lock().window
    }
}

/// One [`FixedWindowCounter`] per key, created on first sight.
pub struct KeyedFixedWindow {
    config: FixedWindowConfig,
    counters: DashMap<String, FixedWindowCounter>,
}

impl KeyedFixedWindow {
    /// Create an empty keyed counter set.
    pub fn new(config: FixedWindowConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
        }
    }

    /// Decide whether a request for `key` may proceed now.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Decide whether a request for `key` may proceed at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        if let Some(counter) = self.counters.get(key) {
            return counter.allow_at(now);
        }

        let counter = self.counters.entry(key.to_owned()).or_insert_with(|| {
            debug!(key = %key, rate = self.config.rate, "Creating fixed window counter");
            FixedWindowCounter::starting_at(self.config.rate, self.config.window(), now)
        });
        counter.allow_at(now)
    }

    /// Counted requests for `key`, if seen.
    pub fn count(&self, key: &str) -> Option<u64> {
        self.counters.get(key).map(|c| c.count())
    }

    /// Number of keys with a counter.
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }
}
