//! In-memory sliding window store.
//!
//! Each key keeps two fixed-window counters: the window containing `now` and
//! the one before it. The limiter weights the previous count by how much of
//! it still overlaps a window-length span ending at `now`, which approximates
//! a true sliding log with constant memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::backend::{WindowCounts, WindowStore};
use super::clock::{seconds_between, Clock, SystemClock};
use super::keyed::KeyedMap;
use super::sweeper::{StoreOptions, Sweeper};
use crate::error::{RatewardenError, Result};

/// Age of `window_start` after which a window entry is evicted.
pub const DEFAULT_WINDOW_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Per-key sliding window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Requests counted in the current window
    pub current: u64,
    /// Requests counted in the window before it
    pub previous: u64,
    /// Unix seconds of the current window's boundary
    pub window_start: i64,
}

impl WindowEntry {
    fn new(window_start: i64, current: u64) -> Self {
        Self {
            current,
            previous: 0,
            window_start,
        }
    }

    /// Move to the window opening at `window_start` if it is later than the
    /// stored one.
    ///
    /// The previous count only carries over when the new window directly
    /// follows the old one; after a longer gap the window before `now` saw no
    /// traffic.
    fn roll(&mut self, window_start: i64, window_secs: i64) {
        if window_start <= self.window_start {
            return;
        }
        self.previous = if window_start - self.window_start == window_secs {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.window_start = window_start;
    }

    fn counts(&self) -> WindowCounts {
        WindowCounts {
            current: self.current,
            previous: self.previous,
            window_start: self.window_start,
        }
    }
}

/// Boundary of the window of length `window_secs` containing `now`, in Unix seconds.
pub fn window_start_for(now: DateTime<Utc>, window_secs: i64) -> i64 {
    now.timestamp().div_euclid(window_secs) * window_secs
}

/// Weighted view of a key's two windows at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEstimate {
    /// `current + previous * weight`
    pub effective: f64,
    /// Share of the previous window still inside the sliding span, in `[0, 1]`
    pub previous_weight: f64,
    /// Whole seconds until the current window closes
    pub reset_seconds: u64,
}

impl WindowEstimate {
    /// Combine raw counters into the sliding estimate at `now`.
    pub fn at(counts: &WindowCounts, window: Duration, now: DateTime<Utc>) -> Self {
        let window_secs = window.as_secs_f64();
        let start = DateTime::from_timestamp(counts.window_start, 0).unwrap_or_default();

        let elapsed = seconds_between(start, now).clamp(0.0, window_secs);
        let previous_weight = (1.0 - elapsed / window_secs).max(0.0);
        let effective = counts.current as f64 + counts.previous as f64 * previous_weight;

        Self {
            effective,
            previous_weight,
            reset_seconds: (window_secs - elapsed).ceil().max(0.0) as u64,
        }
    }

    /// Whether one more request would exceed `limit`.
    pub fn is_exceeded(&self, limit: u64) -> bool {
        self.effective >= limit as f64
    }

    /// Quota left under `limit`, never negative.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.effective.floor() as u64)
    }
}

struct WindowShared {
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    entries: KeyedMap<WindowEntry>,
}

impl WindowShared {
    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.options.ttl_cutoff(now).timestamp();
        self.entries.evict(|entry| entry.window_start < cutoff)
    }
}

/// Sliding window store keeping every key's counters in process memory.
pub struct MemoryWindowStore {
    shared: Arc<WindowShared>,
    sweeper: Sweeper,
}

impl MemoryWindowStore {
    /// Create a store on wall-clock time with default eviction settings.
    pub fn new() -> Self {
        Self::build(StoreOptions::for_windows(), Arc::new(SystemClock))
    }

    /// Create a store with explicit eviction settings and clock.
    pub fn with_options(options: StoreOptions, clock: Arc<dyn Clock>) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(options, clock))
    }

    fn build(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(WindowShared {
            options,
            clock,
            entries: KeyedMap::new(),
        });

        let sweep_target = Arc::clone(&shared);
        let sweeper = Sweeper::start("sliding_window", options.sweep_interval, move || {
            sweep_target.evict_expired(sweep_target.clock.now())
        });

        Self { shared, sweeper }
    }

    /// Read the counters for `key` at `now`, rolling over if needed.
    pub fn counts_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCounts> {
        let window_secs = window_seconds(window)?;
        let start = window_start_for(now, window_secs);

        let (counts, created) = self.shared.entries.update(
            key,
            || WindowEntry::new(start, 0),
            |entry| {
                entry.roll(start, window_secs);
                entry.counts()
            },
        );

        if created {
            debug!(key = %key, window_start = start, "Creating new sliding window");
        }
        Ok(counts)
    }

    /// Count one request for `key` at `now`.
    pub fn incr_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<()> {
        let window_secs = window_seconds(window)?;
        let start = window_start_for(now, window_secs);

        let (current, created) = self.shared.entries.update(
            key,
            || WindowEntry::new(start, 0),
            |entry| {
                entry.roll(start, window_secs);
                entry.current += 1;
                entry.current
            },
        );

        if created {
            debug!(key = %key, window_start = start, "Creating new sliding window");
        }
        trace!(key = %key, current, "Sliding window incremented");
        Ok(())
    }

    /// Stored counters for `key` without rolling over.
    pub fn entry(&self, key: &str) -> Option<WindowEntry> {
        self.shared.entries.inspect(key, |entry| *entry)
    }

    /// Remove windows whose start is older than the TTL as of `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.shared.evict_expired(now)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all windows.
    pub fn clear(&self) {
        self.shared.entries.clear();
    }

    /// Stop background eviction. Safe to call more than once.
    pub fn stop(&self) {
        self.sweeper.stop();
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWindowStore")
            .field("options", &self.shared.options)
            .field("entries", &self.shared.entries.len())
            .finish()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn get_counts(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCounts> {
        self.counts_at(key, window, now)
    }

    async fn incr(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<()> {
        self.incr_at(key, window, now)
    }
}

/// Window length in whole seconds; sub-second and fractional windows are rejected.
pub(crate) fn window_seconds(window: Duration) -> Result<i64> {
    if window.as_secs() == 0 || window.subsec_nanos() != 0 {
        return Err(RatewardenError::Config(format!(
            "sliding window must be a whole number of seconds, got {:?}",
            window
        )));
    }
    i64::try_from(window.as_secs())
        .map_err(|_| RatewardenError::Config(format!("sliding window too large: {:?}", window)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SECOND: Duration = Duration::from_secs(1);

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn store() -> MemoryWindowStore {
        MemoryWindowStore::with_options(
            StoreOptions::for_windows(),
            Arc::new(ManualClock::from_unix_millis(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_window_start_truncates() {
        assert_eq!(window_start_for(at(61_500), 60), 60);
        assert_eq!(window_start_for(at(59_999), 60), 0);
        assert_eq!(window_start_for(at(-1_000), 60), -60);
    }

    #[test]
    fn test_get_counts_creates_empty_window() {
        let store = store();
        let counts = store.counts_at("k", SECOND, at(10_400)).unwrap();
        assert_eq!(
            counts,
            WindowCounts {
                current: 0,
                previous: 0,
                window_start: 10
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_incr_creates_window_with_one() {
        let store = store();
        store.incr_at("k", SECOND, at(10_400)).unwrap();
        let entry = store.entry("k").unwrap();
        assert_eq!(entry.current, 1);
        assert_eq!(entry.window_start, 10);
    }

    #[test]
    fn test_rollover_moves_current_to_previous() {
        let store = store();
        for _ in 0..4 {
            store.incr_at("k", SECOND, at(10_100)).unwrap();
        }

        store.incr_at("k", SECOND, at(11_050)).unwrap();
        let entry = store.entry("k").unwrap();
        assert_eq!(entry.previous, 4);
        assert_eq!(entry.current, 1);
        assert_eq!(entry.window_start, 11);

        let counts = store.counts_at("k", SECOND, at(12_000)).unwrap();
        assert_eq!(counts.previous, 1);
        assert_eq!(counts.current, 0);
    }

    #[test]
    fn test_rollover_after_gap_clears_previous() {
        let store = store();
        for _ in 0..4 {
            store.incr_at("k", SECOND, at(10_100)).unwrap();
        }
        let counts = store.counts_at("k", SECOND, at(15_000)).unwrap();
        assert_eq!(counts.previous, 0);
        assert_eq!(counts.current, 0);
        assert_eq!(counts.window_start, 15);
    }

    #[test]
    fn test_backwards_clock_does_not_regress_window() {
        let store = store();
        store.incr_at("k", SECOND, at(20_000)).unwrap();
        store.incr_at("k", SECOND, at(18_000)).unwrap();
        let entry = store.entry("k").unwrap();
        assert_eq!(entry.window_start, 20);
        assert_eq!(entry.current, 2);
    }

    #[test]
    fn test_estimate_weights_previous_window() {
        let counts = WindowCounts {
            current: 2,
            previous: 10,
            window_start: 100,
        };
        let estimate = WindowEstimate::at(&counts, Duration::from_secs(10), at(102_500));
        assert!((estimate.previous_weight - 0.75).abs() < 1e-9);
        assert!((estimate.effective - 9.5).abs() < 1e-9);
        assert_eq!(estimate.remaining(10), 1);
        assert!(!estimate.is_exceeded(10));
        assert!(estimate.is_exceeded(9));
        assert_eq!(estimate.reset_seconds, 8);
    }

    #[test]
    fn test_estimate_remaining_saturates() {
        let counts = WindowCounts {
            current: 20,
            previous: 0,
            window_start: 0,
        };
        let estimate = WindowEstimate::at(&counts, SECOND, at(500));
        assert_eq!(estimate.remaining(5), 0);
    }

    #[test]
    fn test_evict_expired_against_window_start() {
        let store = store();
        store.incr_at("stale", SECOND, at(0)).unwrap();
        store.incr_at("live", SECOND, at(7_000_000)).unwrap();

        let removed = store.evict_expired(at(7_201_000));
        assert_eq!(removed, 1);
        assert!(store.entry("stale").is_none());
        assert!(store.entry("live").is_some());
    }

    #[test]
    fn test_invalid_window_rejected() {
        let store = store();
        assert!(store.incr_at("k", Duration::ZERO, at(0)).is_err());
        assert!(store.counts_at("k", Duration::from_millis(1_500), at(0)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_counters_consistent_under_random_traffic() {
        let mut rng = StdRng::seed_from_u64(42);
        let store = store();
        let window = Duration::from_secs(5);
        let mut now = 1_700_000_000_000i64;
        let mut last_start = i64::MIN;
        let mut in_window = 0u64;

        for _ in 0..2_000 {
            now += rng.gen_range(0..1_500);
            if rng.gen_bool(0.7) {
                store.incr_at("prop", window, at(now)).unwrap();
            } else {
                store.counts_at("prop", window, at(now)).unwrap();
            }

            let entry = store.entry("prop").unwrap();
            assert!(entry.window_start >= last_start, "window start regressed");
            if entry.window_start != last_start {
                in_window = 0;
            }
            last_start = entry.window_start;
            in_window = in_window.max(entry.current);
            assert_eq!(entry.current, in_window);
            assert_eq!(entry.window_start % 5, 0);
        }
    }
}
