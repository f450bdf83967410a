//! Background eviction loop owned by each in-memory store.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bucket::DEFAULT_BUCKET_TTL;
use super::window::DEFAULT_WINDOW_TTL;
use crate::error::{RatewardenError, Result};

/// Default interval between eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Tuning for the in-memory stores' eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Time between background sweeps
    pub sweep_interval: Duration,
    /// Idle time after which an entry is removed
    pub ttl: Duration,
}

impl StoreOptions {
    /// Defaults for token bucket stores: sweep every 5 minutes, 1 hour TTL.
    pub fn for_buckets() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ttl: DEFAULT_BUCKET_TTL,
        }
    }

    /// Defaults for sliding window stores: sweep every 5 minutes, 2 hour TTL.
    pub fn for_windows() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ttl: DEFAULT_WINDOW_TTL,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(RatewardenError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn ttl_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ChronoDuration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A ticking task that runs a sweep closure until stopped.
///
/// Stopping is idempotent: `stop` may be called any number of times, and the
/// task is also stopped when the sweeper is dropped.
#[derive(Debug)]
pub struct Sweeper {
    name: &'static str,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after start. Without a runtime
    /// the returned sweeper is inert and sweeping is left to the owner.
    pub fn start<F>(name: &'static str, interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> usize + Send + 'static,
    {
        let shutdown = CancellationToken::new();

        let Ok(runtime) = Handle::try_current() else {
            warn!(sweeper = name, "No tokio runtime available, background eviction disabled");
            return Self {
                name,
                shutdown,
                handle: None,
            };
        };

        let token = shutdown.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(sweeper = name, "Sweeper cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = sweep();
                        if evicted > 0 {
                            info!(sweeper = name, evicted, "Evicted idle rate limit entries");
                        }
                    }
                }
            }
        });

        info!(sweeper = name, interval_secs = interval.as_secs(), "Sweeper started");

        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the sweep loop. Safe to call more than once.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(sweeper = self.name, "Stopping sweeper");
        }
        self.shutdown.cancel();
    }

    /// Whether the loop has been asked to stop (or never ran).
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled() || self.handle.is_none()
    }

    /// Stop the loop and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(sweeper = self.name, error = %err, "Sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::test_support::capture_warnings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ticks_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let sweeper = Sweeper::start("test", Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        sweeper.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sweeper = Sweeper::start("test", Duration::from_secs(60), || 0);
        assert!(!sweeper.is_stopped());

        sweeper.stop();
        sweeper.stop();
        sweeper.stop();
        assert!(sweeper.is_stopped());

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sweep_is_reported_on_shutdown() {
        let (logs, _guard) = capture_warnings();
        let sweeper = Sweeper::start("test", Duration::from_secs(10), || {
            panic!("sweep failed");
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        sweeper.shutdown().await;

        let output = logs.contents();
        assert!(output.contains("Sweeper task ended abnormally"), "logs: {}", output);
        assert!(output.contains("sweeper=\"test\"") || output.contains("sweeper=test"));
    }

    #[test]
    fn test_sweeper_without_runtime_is_inert() {
        let sweeper = Sweeper::start("test", Duration::from_secs(1), || 0);
        assert!(sweeper.is_stopped());
        sweeper.stop();
    }
}
