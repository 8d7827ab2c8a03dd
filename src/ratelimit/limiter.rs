//! Sliding window admission limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::registry::KeyLockRegistry;
use super::slot::{TimeSlot, WindowSeries};
use crate::error::{AdmissionError, Result};

/// Default slot length in milliseconds.
const DEFAULT_SLOT_DURATION_MS: u64 = 100;
/// Default window length in milliseconds.
const DEFAULT_WINDOW_DURATION_MS: u64 = 1000;
/// Default budget per window.
const DEFAULT_MAX_REQUESTS: u64 = 10;
/// Upper bound on the slots reserved up front for a new key.
const MAX_PREALLOCATED_SLOTS: usize = 64;

/// Which requests are written into the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Record every request, admitted or denied. A sustained excess keeps the
    /// window saturated until callers back off.
    #[default]
    Always,
    /// Record only admitted requests, letting the window drain under overload.
    AdmittedOnly,
}

/// Configuration for a [`SlidingWindowLimiter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Slot granularity in milliseconds
    #[serde(default = "default_slot_duration_ms")]
    pub slot_duration_ms: u64,

    /// Trailing window in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Admitted requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Whether denied requests are recorded
    #[serde(default)]
    pub record_policy: RecordPolicy,

    /// Interval for the idle-key sweeper, disabled when unset
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            slot_duration_ms: default_slot_duration_ms(),
            window_duration_ms: default_window_duration_ms(),
            max_requests: default_max_requests(),
            record_policy: RecordPolicy::default(),
            sweep_interval_ms: None,
        }
    }
}

fn default_slot_duration_ms() -> u64 {
    DEFAULT_SLOT_DURATION_MS
}

fn default_window_duration_ms() -> u64 {
    DEFAULT_WINDOW_DURATION_MS
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

impl SlidingWindowConfig {
    /// Build a config from durations, keeping the other fields at defaults.
    ///
    /// Fails unless both durations are a whole number of milliseconds.
    pub fn from_durations(slot: Duration, window: Duration, max_requests: u64) -> Result<Self> {
        Ok(Self {
            slot_duration_ms: whole_millis("slot", slot)?,
            window_duration_ms: whole_millis("window", window)?,
            max_requests,
            ..Self::default()
        })
    }

    /// Slot granularity.
    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_duration_ms)
    }

    /// Trailing window length.
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Slots per window. Not a cap on series length.
    pub fn slot_count(&self) -> usize {
        if self.slot_duration_ms == 0 {
            return 0;
        }
        usize::try_from(self.window_duration_ms / self.slot_duration_ms).unwrap_or(usize::MAX)
    }

    /// Reject configurations that leave the slot count undefined.
    pub fn validate(&self) -> Result<()> {
        if self.slot_duration_ms == 0 {
            return Err(AdmissionError::Config(
                "slot_duration_ms must be greater than 0".to_string(),
            ));
        }
        if self.window_duration_ms == 0 {
            return Err(AdmissionError::Config(
                "window_duration_ms must be greater than 0".to_string(),
            ));
        }
        if self.slot_duration_ms > self.window_duration_ms {
            return Err(AdmissionError::Config(format!(
                "slot_duration_ms ({}) must not exceed window_duration_ms ({})",
                self.slot_duration_ms, self.window_duration_ms
            )));
        }
        if self.window_duration_ms % self.slot_duration_ms != 0 {
            return Err(AdmissionError::Config(format!(
                "window_duration_ms ({}) must be a multiple of slot_duration_ms ({})",
                self.window_duration_ms, self.slot_duration_ms
            )));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(AdmissionError::Config(
                "sweep_interval_ms must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn whole_millis(name: &str, duration: Duration) -> Result<u64> {
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(AdmissionError::Config(format!(
            "{} duration {:?} is not a whole number of milliseconds",
            name, duration
        )));
    }
    u64::try_from(duration.as_millis()).map_err(|_| {
        AdmissionError::Config(format!("{} duration {:?} is too long", name, duration))
    })
}

/// In-memory sliding window limiter keyed by caller identity.
///
/// Each key owns a [`WindowSeries`] behind its own lock in a
/// [`KeyLockRegistry`]. A decision evicts expired slots, compares the
/// remaining aggregate with the budget and records the request, all inside
/// one write-locked section, so concurrent callers for the same key are
/// serialized and callers for different keys never wait on each other.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use rate_admission::ratelimit::SlidingWindowLimiter;
///
/// let limiter = SlidingWindowLimiter::from_durations(
///     Duration::from_millis(100),
///     Duration::from_secs(1),
///     2,
/// )
/// .unwrap();
///
/// assert!(limiter.allow("10.0.0.1"));
/// assert!(limiter.allow("10.0.0.1"));
/// assert!(limiter.is_limited("10.0.0.1"));
/// ```
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    slot_duration: Duration,
    window_duration: Duration,
    series: KeyLockRegistry<WindowSeries>,
}

impl SlidingWindowLimiter {
    /// Create a limiter, failing on an unusable configuration.
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        config.validate()?;
        if config.max_requests == 0 {
            warn!("max_requests is 0, every request will be denied");
        }

        Ok(Self {
            slot_duration: config.slot_duration(),
            window_duration: config.window_duration(),
            config,
            series: KeyLockRegistry::new(),
        })
    }

    /// Create a limiter from `(slot, window, max_requests)`.
    pub fn from_durations(slot: Duration, window: Duration, max_requests: u64) -> Result<Self> {
        Self::new(SlidingWindowConfig::from_durations(slot, window, max_requests)?)
    }

    /// Decide whether a request for `key` may proceed now.
    ///
    /// The clock is read after the key's lock is taken, so callers that queue
    /// on the same key are decided in the order of the times they record.
    pub fn allow(&self, key: &str) -> bool {
        self.decide(key, None)
    }

    /// Decide whether a request for `key` may proceed at `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        self.decide(key, Some(now))
    }

    fn decide(&self, key: &str, at: Option<Instant>) -> bool {
        let (lock, created) = self.series.lock_for_with(key, || {
            WindowSeries::with_capacity(self.config.slot_count().min(MAX_PREALLOCATED_SLOTS))
        });
        if created {
            debug!(key = %key, "Tracking new key");
        }

        let mut series = lock.write();
        let now = at.unwrap_or_else(Instant::now);
        series.evict_expired(now, self.window_duration);

        let aggregate = series.aggregate();
        let admitted = aggregate < self.config.max_requests;

        if admitted || self.config.record_policy == RecordPolicy::Always {
            series.record(now, self.slot_duration);
        }

        trace!(
            key = %key,
            aggregate = aggregate,
            admitted = admitted,
            "Sliding window decision"
        );
        if !admitted {
            debug!(
                key = %key,
                aggregate = aggregate,
                max_requests = self.config.max_requests,
                "Request denied"
            );
        }

        admitted
    }

    /// Whether a request for `key` is blocked now. Records the request.
    pub fn is_limited(&self, key: &str) -> bool {
        !self.allow(key)
    }

    /// Whether a request for `key` is blocked at `now`. Records the request.
    pub fn is_limited_at(&self, key: &str, now: Instant) -> bool {
        !self.allow_at(key, now)
    }

    /// Current aggregate for `key` without evicting or recording.
    ///
    /// Returns `None` if the key has never been seen.
    pub fn aggregate(&self, key: &str) -> Option<u64> {
        self.series.get(key).map(|lock| lock.read().aggregate())
    }

    /// Snapshot of the retained slots for `key`, oldest first.
    pub fn slots(&self, key: &str) -> Vec<TimeSlot> {
        self.series
            .get(key)
            .map(|lock| lock.read().slots().copied().collect())
            .unwrap_or_default()
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.series.len()
    }

    /// Slots per window.
    pub fn slot_count(&self) -> usize {
        self.config.slot_count()
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Evict expired slots and forget keys with nothing left in their window.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Like [`sweep_idle`](Self::sweep_idle), evaluated at `now`.
    ///
    /// Keys whose lock is currently held are skipped.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let window = self.window_duration;
        let removed = self.series.sweep(|series| {
            series.evict_expired(now, window);
            series.is_empty()
        });

        if removed > 0 {
            info!(
                removed = removed,
                remaining = self.series.len(),
                "Swept idle keys"
            );
        }
        removed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` on the tokio runtime.
    ///
    /// The task holds a strong reference; abort the handle to stop it.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn limiter(max_requests: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::from_durations(ms(100), ms(1000), max_requests).unwrap()
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = limiter(10);
        assert_eq!(limiter.key_count(), 0);
        assert_eq!(limiter.slot_count(), 10);
    }

    #[test]
    fn test_rejects_zero_slot_duration() {
        let result = SlidingWindowLimiter::from_durations(Duration::ZERO, ms(1000), 10);
        assert!(matches!(result, Err(AdmissionError::Config(_))));
    }

    #[test]
    fn test_rejects_slot_longer_than_window() {
        let result = SlidingWindowLimiter::from_durations(ms(2000), ms(1000), 10);
        assert!(matches!(result, Err(AdmissionError::Config(_))));
    }

    #[test]
    fn test_rejects_uneven_slot_division() {
        let result = SlidingWindowLimiter::from_durations(ms(300), ms(1000), 10);
        assert!(matches!(result, Err(AdmissionError::Config(_))));
    }

    #[test]
    fn test_rejects_sub_millisecond_durations() {
        let result = SlidingWindowLimiter::from_durations(
            Duration::from_micros(1500),
            Duration::from_micros(3000),
            10,
        );
        assert!(matches!(result, Err(AdmissionError::Config(_))));

        let config = SlidingWindowConfig::from_durations(ms(1), Duration::from_micros(3000), 10);
        assert_eq!(config.unwrap().slot_count(), 3);
    }

    #[test]
    fn test_huge_window_does_not_preallocate() {
        let config = SlidingWindowConfig {
            slot_duration_ms: 1,
            window_duration_ms: 1 << 62,
            max_requests: 2,
            ..SlidingWindowConfig::default()
        };
        let limiter = SlidingWindowLimiter::new(config).unwrap();
        let t0 = Instant::now();

        assert!(limiter.allow_at("k", t0));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow_at("k", t0 + ms(5)));
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_zero_budget_denies_everything() {
        let limiter = limiter(0);
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(!limiter.allow_at("k", t0 + ms(i * 300)));
        }
    }

    #[test]
    fn test_burst_then_drain() {
        let limiter = limiter(3);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("k", t0));
        }
        assert!(!limiter.allow_at("k", t0));

        // Everything recorded at t0 has aged out one window later
        assert!(limiter.allow_at("k", t0 + ms(1000)));
        assert_eq!(limiter.aggregate("k"), Some(1));
    }

    #[test]
    fn test_denied_request_is_recorded() {
        let limiter = limiter(2);
        let t0 = Instant::now();

        limiter.allow_at("k", t0);
        limiter.allow_at("k", t0);
        let before = limiter.aggregate("k").unwrap();

        assert!(!limiter.allow_at("k", t0 + ms(10)));
        assert_eq!(limiter.aggregate("k"), Some(before + 1));
    }

    #[test]
    fn test_admitted_only_policy_skips_denials() {
        let config = SlidingWindowConfig {
            max_requests: 2,
            record_policy: RecordPolicy::AdmittedOnly,
            ..SlidingWindowConfig::default()
        };
        let limiter = SlidingWindowLimiter::new(config).unwrap();
        let t0 = Instant::now();

        limiter.allow_at("k", t0);
        limiter.allow_at("k", t0);
        assert!(!limiter.allow_at("k", t0 + ms(10)));
        assert_eq!(limiter.aggregate("k"), Some(2));
    }

    #[test]
    fn test_denials_keep_window_saturated() {
        let limiter = limiter(2);
        let t0 = Instant::now();

        limiter.allow_at("k", t0);
        limiter.allow_at("k", t0);
        // Denied, but recorded at 600
        assert!(!limiter.allow_at("k", t0 + ms(600)));
        assert!(!limiter.allow_at("k", t0 + ms(650)));

        // The t0 slot has expired, the denied slot at 600 still counts 2
        assert!(!limiter.allow_at("k", t0 + ms(1000)));
    }

    #[test]
    fn test_slot_coalescing() {
        let limiter = limiter(10);
        let t0 = Instant::now();

        limiter.allow_at("k", t0);
        limiter.allow_at("k", t0 + ms(50));

        let slots = limiter.slots("k");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].count(), 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1);
        let t0 = Instant::now();

        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));

        assert_eq!(limiter.aggregate("a"), Some(2));
        assert_eq!(limiter.aggregate("b"), Some(1));
        assert_eq!(limiter.key_count(), 2);
    }

    #[test]
    fn test_reference_scenario() {
        let limiter = limiter(10);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(!limiter.is_limited_at("ip", t0));
        }
        for _ in 0..5 {
            assert!(!limiter.is_limited_at("ip", t0 + ms(100)));
        }
        assert!(limiter.is_limited_at("ip", t0 + ms(100)));
        assert_eq!(limiter.slots("ip").len(), 2);

        let later = t0 + ms(1200);
        for _ in 0..7 {
            assert!(!limiter.is_limited_at("ip", later));
        }
        let slots = limiter.slots("ip");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].count(), 7);
    }

    #[test]
    fn test_clock_regression_is_clamped() {
        let limiter = limiter(10);
        let t0 = Instant::now();

        limiter.allow_at("k", t0 + ms(500));
        assert!(limiter.allow_at("k", t0));

        let slots = limiter.slots("k");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].count(), 2);
    }

    #[test]
    fn test_unknown_key_has_no_state() {
        let limiter = limiter(10);
        assert_eq!(limiter.aggregate("missing"), None);
        assert!(limiter.slots("missing").is_empty());
    }

    #[test]
    fn test_sweep_idle_drops_expired_keys() {
        let limiter = limiter(10);
        let t0 = Instant::now();

        limiter.allow_at("old", t0);
        limiter.allow_at("fresh", t0 + ms(900));

        let removed = limiter.sweep_idle_at(t0 + ms(1000));

        assert_eq!(removed, 1);
        assert_eq!(limiter.key_count(), 1);
        assert_eq!(limiter.aggregate("old"), None);
        assert_eq!(limiter.aggregate("fresh"), Some(1));
    }

    #[test]
    fn test_clock_read_after_lock_is_taken() {
        let limiter = limiter(10);
        let lock = limiter.series.lock_for("k");
        let guard = lock.write();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| limiter.allow("k"));
            std::thread::sleep(ms(50));
            let released = Instant::now();
            drop(guard);

            assert!(waiter.join().unwrap());
            let slots = limiter.slots("k");
            assert_eq!(slots.len(), 1);
            assert!(slots[0].start() >= released);
        });
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let limiter = Arc::new(
            SlidingWindowLimiter::from_durations(ms(10), ms(20), 5).unwrap(),
        );
        limiter.allow("k");

        let handle = Arc::clone(&limiter).spawn_sweeper(ms(10));
        tokio::time::sleep(ms(100)).await;
        handle.abort();

        assert_eq!(limiter.key_count(), 0);
    }
}
