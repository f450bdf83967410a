//! Store traits for abstracting in-memory and remote per-key state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Outcome of a single token bucket admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    /// Whether a token was taken
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining: u64,
    /// Seconds until asking again is worthwhile (at least 1)
    pub reset_seconds: u64,
}

/// Raw counters of a sliding window key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowCounts {
    /// Requests counted in the window containing `now`
    pub current: u64,
    /// Requests counted in the window before it
    pub previous: u64,
    /// Unix seconds of the boundary that opens the current window
    pub window_start: i64,
}

/// Store backing the token bucket algorithm.
///
/// Implementations own `rate` and `burst`; the in-memory version is
/// [`MemoryTokenBucketStore`](super::MemoryTokenBucketStore). Errors are
/// treated as fail-open by the limiter.
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    /// Try to take one token for `key` at `now`.
    async fn allow(&self, key: &str, now: DateTime<Utc>) -> Result<BucketDecision>;
}

/// Store backing the sliding window algorithm.
///
/// A remote implementation may block on I/O; the limiter drops the future on
/// cancellation or timeout, so implementations must be cancel-safe.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Read the counters for `key`, rolling the window over first if `now`
    /// falls into a later window than the stored one.
    ///
    /// On rollover `previous` takes the old `current` only when the new window
    /// directly follows the stored one; after a longer gap it is 0.
    async fn get_counts(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCounts>;

    /// Count one request for `key` in the window containing `now`.
    async fn incr(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<()>;
}
