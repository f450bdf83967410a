//! In-memory token bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::backend::{BucketDecision, TokenBucketStore};
use super::clock::{seconds_between, Clock, SystemClock};
use super::keyed::KeyedMap;
use super::sweeper::{StoreOptions, Sweeper};
use crate::error::{RatewardenError, Result};

/// Idle time after which a bucket is evicted.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

/// Per-key token bucket state.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketEntry {
    /// Tokens currently available, in `[0, burst]`
    pub tokens: f64,
    /// Last time the bucket was refilled
    pub last_update: DateTime<Utc>,
}

impl BucketEntry {
    /// A full bucket: the first burst of a new key is free.
    pub fn new(burst: u32, now: DateTime<Utc>) -> Self {
        Self {
            tokens: burst as f64,
            last_update: now,
        }
    }

    /// Refill for the time elapsed since the last update, then try to take a token.
    ///
    /// A clock that moved backwards refills nothing and does not move
    /// `last_update` back.
    pub fn take(&mut self, now: DateTime<Utc>, rate: f64, burst: u32) -> BucketDecision {
        let elapsed = seconds_between(self.last_update, now).max(0.0);
        self.tokens = (self.tokens + elapsed * rate).min(burst as f64);
        if now > self.last_update {
            self.last_update = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            BucketDecision {
                allowed: true,
                remaining: self.tokens.floor() as u64,
                reset_seconds: 1,
            }
        } else {
            let wait = ((1.0 - self.tokens) / rate).ceil();
            BucketDecision {
                allowed: false,
                remaining: 0,
                reset_seconds: (wait as u64).max(1),
            }
        }
    }
}

struct BucketShared {
    rate: f64,
    burst: u32,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    entries: KeyedMap<BucketEntry>,
}

impl BucketShared {
    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.options.ttl_cutoff(now);
        self.entries.evict(|entry| entry.last_update < cutoff)
    }
}

/// Token bucket store keeping every key's bucket in process memory.
///
/// Buckets refill continuously at `rate` tokens per second up to `burst`.
/// Idle buckets are evicted by a background [`Sweeper`].
pub struct MemoryTokenBucketStore {
    shared: Arc<BucketShared>,
    sweeper: Sweeper,
}

impl MemoryTokenBucketStore {
    /// Create a store on wall-clock time with default eviction settings.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        Self::with_options(rate, burst, StoreOptions::for_buckets(), Arc::new(SystemClock))
    }

    /// Create a store with explicit eviction settings and clock.
    pub fn with_options(
        rate: f64,
        burst: u32,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_bucket(rate, burst)?;
        options.validate()?;

        let shared = Arc::new(BucketShared {
            rate,
            burst,
            options,
            clock,
            entries: KeyedMap::new(),
        });

        let sweep_target = Arc::clone(&shared);
        let sweeper = Sweeper::start("token_bucket", options.sweep_interval, move || {
            sweep_target.evict_expired(sweep_target.clock.now())
        });

        Ok(Self { shared, sweeper })
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.shared.rate
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.shared.burst
    }

    /// Take a token for `key` at `now`.
    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> BucketDecision {
        let rate = self.shared.rate;
        let burst = self.shared.burst;
        let (decision, created) = self.shared.entries.update(
            key,
            || BucketEntry::new(burst, now),
            |entry| entry.take(now, rate, burst),
        );

        if created {
            debug!(key = %key, burst, rate, "Creating new token bucket");
        }
        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Token bucket checked"
        );
        decision
    }

    /// Current tokens for `key`, if it has a bucket.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.shared.entries.inspect(key, |entry| entry.tokens)
    }

    /// Remove buckets idle for longer than the TTL as of `now`.
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

    /// Drop all buckets.
    pub fn clear(&self) {
        self.shared.entries.clear();
    }

    /// Stop background eviction. Safe to call more than once.
    pub fn stop(&self) {
        self.sweeper.stop();
    }
}

impl std::fmt::Debug for MemoryTokenBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenBucketStore")
            .field("rate", &self.shared.rate)
            .field("burst", &self.shared.burst)
            .field("options", &self.shared.options)
            .field("entries", &self.shared.entries.len())
            .finish()
    }
}

#[async_trait]
impl TokenBucketStore for MemoryTokenBucketStore {
    async fn allow(&self, key: &str, now: DateTime<Utc>) -> Result<BucketDecision> {
        Ok(self.allow_at(key, now))
    }
}

pub(crate) fn validate_bucket(rate: f64, burst: u32) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(RatewardenError::Config(format!(
            "token bucket rate must be a positive number, got {}",
            rate
        )));
    }
    if burst == 0 {
        return Err(RatewardenError::Config(
            "token bucket burst must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
