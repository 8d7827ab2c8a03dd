//! Time slots and the per-key window series built from them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A bucket counting the requests that arrived in
/// `[start, start + slot_duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    start: Instant,
    count: u64,
}

impl TimeSlot {
    fn open(start: Instant) -> Self {
        Self { start, count: 1 }
    }

    /// When this slot began.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Number of requests recorded in this slot. Always at least 1.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Time-ordered slots for a single key.
///
/// Only the newest slot ever grows; older slots are left alone until they fall
/// out of the window and are trimmed from the front.
#[derive(Debug, Clone, Default)]
pub struct WindowSeries {
    slots: VecDeque<TimeSlot>,
}

impl WindowSeries {
    /// Create an empty series with room for `slot_count` slots.
    pub fn with_capacity(slot_count: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(slot_count),
        }
    }

    /// Sum of all retained slot counts.
    pub fn aggregate(&self) -> u64 {
        self.slots.iter().map(|slot| slot.count).sum()
    }

    /// Record one request at `now`.
    ///
    /// Opens a new slot when the series is empty or the newest slot's interval
    /// has ended at or before `now`; otherwise the newest slot is incremented.
    /// A `now` earlier than the newest slot's start is counted into that slot,
    /// so starts stay strictly increasing even if the clock goes backwards.
    pub fn record(&mut self, now: Instant, slot_duration: Duration) {
        match self.slots.back_mut() {
            Some(last) if Self::within(last.start, slot_duration, now) => last.count += 1,
            _ => self.slots.push_back(TimeSlot::open(now)),
        }
    }

    fn within(start: Instant, slot_duration: Duration, now: Instant) -> bool {
        // An end past the clock's range never arrives
        start
            .checked_add(slot_duration)
            .map_or(true, |end| now < end)
    }

    /// Drop the prefix of slots whose window has elapsed at `now`.
    ///
    /// Returns how many slots were removed. A slot starting after `now` is
    /// never considered expired.
    pub fn evict_expired(&mut self, now: Instant, window_duration: Duration) -> usize {
        let mut evicted = 0;
        while let Some(oldest) = self.slots.front() {
            match now.checked_duration_since(oldest.start) {
                Some(elapsed) if elapsed >= window_duration => {
                    self.slots.pop_front();
                    evicted += 1;
                }
                _ => break,
            }
        }
        evicted
    }

    /// The newest slot, if any.
    pub fn last(&self) -> Option<&TimeSlot> {
        self.slots.back()
    }

    /// Iterate the retained slots from oldest to newest.
    pub fn slots(&self) -> impl Iterator<Item = &TimeSlot> {
        self.slots.iter()
    }

    /// Number of retained slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots are retained.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
