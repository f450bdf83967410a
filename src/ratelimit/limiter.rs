//! Limiter facade: keys a request, queries a store, and decides.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::backend::{TokenBucketStore, WindowStore};
use super::bucket::{validate_bucket, MemoryTokenBucketStore};
use super::clock::{Clock, SystemClock};
use super::sweeper::StoreOptions;
use super::window::{window_seconds, MemoryWindowStore, WindowEstimate};
use crate::error::{RatewardenError, Result};

/// What the limiter needs to know about an incoming request.
///
/// Only `client_ip` is required; route and method are copied into [`Meta`]
/// for reporting and are empty by default.
pub trait RequestInfo {
    /// Client address as seen by the HTTP layer.
    fn client_ip(&self) -> &str;

    /// Route pattern the request matched.
    fn route(&self) -> &str {
        ""
    }

    /// HTTP method.
    fn method(&self) -> &str {
        ""
    }

    /// Value of a request header, if present.
    fn header(&self, _name: &str) -> Option<&str> {
        None
    }
}

/// A plain, owned request description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParts {
    pub route: String,
    pub method: String,
    pub client_ip: String,
    pub headers: Vec<(String, String)>,
}

impl RequestParts {
    pub fn new(route: &str, method: &str, client_ip: &str) -> Self {
        Self {
            route: route.to_string(),
            method: method.to_string(),
            client_ip: client_ip.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

impl RequestInfo for RequestParts {
    fn client_ip(&self) -> &str {
        &self.client_ip
    }

    fn route(&self) -> &str {
        &self.route
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Function turning a request into its rate limit key.
pub type KeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;

/// Callback invoked with the limit details when a request exceeds its limit.
/// Registering one means the callback owns the response.
pub type ExceededCallback = Arc<dyn Fn(&Meta) + Send + Sync>;

/// Key by client address: `ip:<addr>`.
pub fn key_by_ip<R: RequestInfo + 'static>() -> KeyFn<R> {
    Arc::new(|req: &R| format!("ip:{}", req.client_ip()))
}

/// Key by route and client address: `route:<route>|ip:<addr>`.
pub fn key_by_route_and_ip<R: RequestInfo + 'static>() -> KeyFn<R> {
    Arc::new(|req: &R| format!("route:{}|ip:{}", req.route(), req.client_ip()))
}

/// Key by a header (API key, user id); requests without it fall back to the client address.
pub fn key_by_header<R: RequestInfo + 'static>(name: &str) -> KeyFn<R> {
    let name = name.to_string();
    Arc::new(move |req: &R| match req.header(&name) {
        Some(value) if !value.is_empty() => format!("{}:{}", name.to_ascii_lowercase(), value),
        _ => format!("ip:{}", req.client_ip()),
    })
}

/// Limit details for one request, used to build response headers and bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
    pub window: Duration,
    pub key: String,
    pub route: String,
    pub method: String,
    pub client_ip: String,
}

/// Outcome of [`Limiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Within the limit (or the store failed and the limiter failed open)
    Allowed(Meta),
    /// Over the limit and enforcing: reject with 429
    Blocked(Meta),
    /// Over the limit in report-only mode: let it through
    Reported(Meta),
    /// Over the limit and the exceeded callback took over the response
    Handled(Meta),
}

impl Decision {
    pub fn meta(&self) -> &Meta {
        match self {
            Decision::Allowed(meta)
            | Decision::Blocked(meta)
            | Decision::Reported(meta)
            | Decision::Handled(meta) => meta,
        }
    }

    pub fn into_meta(self) -> Meta {
        match self {
            Decision::Allowed(meta)
            | Decision::Blocked(meta)
            | Decision::Reported(meta)
            | Decision::Handled(meta) => meta,
        }
    }

    /// Whether the request was within its limit.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// Whether the caller should pass the request on to its handler.
    pub fn should_continue(&self) -> bool {
        matches!(self, Decision::Allowed(_) | Decision::Reported(_))
    }

    /// Value for a `Retry-After` header when the request was blocked.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Blocked(meta) => Some(meta.reset_seconds),
            _ => None,
        }
    }

    /// Short label used in logs and CLI output.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allowed(_) => "allowed",
            Decision::Blocked(_) => "blocked",
            Decision::Reported(_) => "reported",
            Decision::Handled(_) => "handled",
        }
    }
}

enum Algorithm {
    TokenBucket {
        store: Arc<dyn TokenBucketStore>,
        burst: u32,
        refill_window: Duration,
    },
    SlidingWindow {
        store: Arc<dyn WindowStore>,
        limit: u64,
        window: Duration,
    },
}

impl Algorithm {
    fn limit(&self) -> u64 {
        match self {
            Algorithm::TokenBucket { burst, .. } => *burst as u64,
            Algorithm::SlidingWindow { limit, .. } => *limit,
        }
    }

    fn window(&self) -> Duration {
        match self {
            Algorithm::TokenBucket { refill_window, .. } => *refill_window,
            Algorithm::SlidingWindow { window, .. } => *window,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket { .. } => "token_bucket",
            Algorithm::SlidingWindow { .. } => "sliding_window",
        }
    }
}

/// Store verdict before policy (enforce / report / callback) is applied.
struct Verdict {
    allowed: bool,
    remaining: u64,
    reset_seconds: u64,
}

/// Admission control for one route or policy.
///
/// Each limiter owns its store unless one is passed in; limiters with
/// different settings must never share a store.
pub struct Limiter<R> {
    algorithm: Algorithm,
    key_fn: KeyFn<R>,
    enforce: bool,
    on_exceeded: Option<ExceededCallback>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
}

impl<R: RequestInfo + 'static> Limiter<R> {
    /// Start building a token bucket limiter: `rate` tokens per second, up to `burst`.
    pub fn token_bucket(rate: f64, burst: u32) -> LimiterBuilder<R> {
        LimiterBuilder::new(AlgorithmParams::TokenBucket {
            rate,
            burst,
            store: None,
        })
    }

    /// Start building a sliding window limiter: `limit` requests per `window`.
    pub fn sliding_window(limit: u64, window: Duration) -> LimiterBuilder<R> {
        LimiterBuilder::new(AlgorithmParams::SlidingWindow {
            limit,
            window,
            store: None,
        })
    }

    /// Decide whether `req` may proceed.
    pub async fn check(&self, req: &R) -> Decision {
        self.decide(req, None).await
    }

    /// Like [`check`](Self::check), but gives up on the store when `cancel`
    /// fires. A cancelled check fails open.
    pub async fn check_with_cancel(&self, req: &R, cancel: &CancellationToken) -> Decision {
        self.decide(req, Some(cancel)).await
    }

    /// Maximum requests per window (burst for token buckets).
    pub fn limit(&self) -> u64 {
        self.algorithm.limit()
    }

    /// Window length (time to refill a full bucket for token buckets).
    pub fn window(&self) -> Duration {
        self.algorithm.window()
    }

    /// Whether exceeded requests are rejected rather than only reported.
    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    async fn decide(&self, req: &R, cancel: Option<&CancellationToken>) -> Decision {
        let key = (self.key_fn)(req);
        let now = self.clock.now();

        trace!(key = %key, algorithm = self.algorithm.name(), "Checking rate limit");

        let verdict = match self.query(&key, now, cancel).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    key = %key,
                    algorithm = self.algorithm.name(),
                    error = %err,
                    "Rate limit store failed, allowing request"
                );
                Verdict {
                    allowed: true,
                    remaining: self.algorithm.limit(),
                    reset_seconds: 0,
                }
            }
        };

        let meta = Meta {
            limit: self.algorithm.limit(),
            remaining: verdict.remaining,
            reset_seconds: verdict.reset_seconds,
            window: self.algorithm.window(),
            key,
            route: req.route().to_string(),
            method: req.method().to_string(),
            client_ip: req.client_ip().to_string(),
        };

        if verdict.allowed {
            return Decision::Allowed(meta);
        }

        debug!(
            key = %meta.key,
            limit = meta.limit,
            reset_seconds = meta.reset_seconds,
            enforce = self.enforce,
            "Rate limit exceeded"
        );

        if let Some(callback) = &self.on_exceeded {
            callback(&meta);
            Decision::Handled(meta)
        } else if self.enforce {
            Decision::Blocked(meta)
        } else {
            Decision::Reported(meta)
        }
    }

    async fn query(
        &self,
        key: &str,
        now: DateTime<Utc>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Verdict> {
        match &self.algorithm {
            Algorithm::TokenBucket { store, .. } => {
                let decision = self.guard(store.allow(key, now), cancel).await?;
                Ok(Verdict {
                    allowed: decision.allowed,
                    remaining: decision.remaining,
                    reset_seconds: decision.reset_seconds,
                })
            }
            Algorithm::SlidingWindow {
                store,
                limit,
                window,
            } => {
                let counts = self.guard(store.get_counts(key, *window, now), cancel).await?;
                let estimate = WindowEstimate::at(&counts, *window, now);

                if estimate.is_exceeded(*limit) {
                    return Ok(Verdict {
                        allowed: false,
                        remaining: 0,
                        reset_seconds: estimate.reset_seconds,
                    });
                }

                self.guard(store.incr(key, *window, now), cancel).await?;
                Ok(Verdict {
                    allowed: true,
                    remaining: estimate.remaining(*limit).saturating_sub(1),
                    reset_seconds: estimate.reset_seconds,
                })
            }
        }
    }

    /// Bound a store call by the configured timeout and the caller's cancellation.
    async fn guard<T, F>(&self, call: F, cancel: Option<&CancellationToken>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.store_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .map_err(|_| RatewardenError::Timeout(limit))?,
                None => call.await,
            }
        };

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(RatewardenError::Cancelled),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        }
    }
}

impl<R> std::fmt::Debug for Limiter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("algorithm", &self.algorithm.name())
            .field("limit", &self.algorithm.limit())
            .field("window", &self.algorithm.window())
            .field("enforce", &self.enforce)
            .field("has_callback", &self.on_exceeded.is_some())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

enum AlgorithmParams {
    TokenBucket {
        rate: f64,
        burst: u32,
        store: Option<Arc<dyn TokenBucketStore>>,
    },
    SlidingWindow {
        limit: u64,
        window: Duration,
        store: Option<Arc<dyn WindowStore>>,
    },
}

/// Builder for [`Limiter`]. Defaults: key by client IP, enforcing, no
/// callback, wall-clock time, in-memory store, no store timeout.
pub struct LimiterBuilder<R> {
    params: AlgorithmParams,
    key_fn: Option<KeyFn<R>>,
    enforce: bool,
    on_exceeded: Option<ExceededCallback>,
    clock: Arc<dyn Clock>,
    store_options: Option<StoreOptions>,
    store_timeout: Option<Duration>,
    mismatched_store: bool,
}

impl<R: RequestInfo + 'static> LimiterBuilder<R> {
    fn new(params: AlgorithmParams) -> Self {
        Self {
            params,
            key_fn: None,
            enforce: true,
            on_exceeded: None,
            clock: Arc::new(SystemClock),
            store_options: None,
            store_timeout: None,
            mismatched_store: false,
        }
    }

    /// How to derive the rate limit key from a request.
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Use a prepared key function such as [`key_by_route_and_ip`].
    pub fn key(mut self, key_fn: KeyFn<R>) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    /// Reject exceeded requests (`true`) or only report them (`false`).
    pub fn enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Hand exceeded requests to `callback` instead of blocking or reporting them.
    pub fn on_exceeded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Meta) + Send + Sync + 'static,
    {
        self.on_exceeded = Some(Arc::new(callback));
        self
    }

    /// Time source for refills and window boundaries.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Eviction settings for the in-memory store created by `build`.
    pub fn store_options(mut self, options: StoreOptions) -> Self {
        self.store_options = Some(options);
        self
    }

    /// Give up on store calls that take longer than `timeout`.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Back a token bucket limiter with a custom store.
    pub fn bucket_store(mut self, custom: Arc<dyn TokenBucketStore>) -> Self {
        match &mut self.params {
            AlgorithmParams::TokenBucket { store, .. } => *store = Some(custom),
            AlgorithmParams::SlidingWindow { .. } => self.mismatched_store = true,
        }
        self
    }

    /// Back a sliding window limiter with a custom store.
    pub fn window_store(mut self, custom: Arc<dyn WindowStore>) -> Self {
        match &mut self.params {
            AlgorithmParams::SlidingWindow { store, .. } => *store = Some(custom),
            AlgorithmParams::TokenBucket { .. } => self.mismatched_store = true,
        }
        self
    }

    /// Validate the settings and create the limiter.
    ///
    /// Must run inside a tokio runtime for the default in-memory store to
    /// evict idle keys in the background.
    pub fn build(self) -> Result<Limiter<R>> {
        if self.mismatched_store {
            return Err(RatewardenError::Config(
                "custom store does not match the limiter algorithm".to_string(),
            ));
        }

        let algorithm = match self.params {
            AlgorithmParams::TokenBucket { rate, burst, store } => {
                validate_bucket(rate, burst)?;
                let refill_window =
                    Duration::try_from_secs_f64(burst as f64 / rate).map_err(|_| {
                        RatewardenError::Config(format!(
                            "token bucket refill time {} / {} is out of range",
                            burst, rate
                        ))
                    })?;
                let store: Arc<dyn TokenBucketStore> = match store {
                    Some(store) => store,
                    None => Arc::new(MemoryTokenBucketStore::with_options(
                        rate,
                        burst,
                        self.store_options.unwrap_or_else(StoreOptions::for_buckets),
                        Arc::clone(&self.clock),
                    )?),
                };
                Algorithm::TokenBucket {
                    store,
                    burst,
                    refill_window,
                }
            }
            AlgorithmParams::SlidingWindow {
                limit,
                window,
                store,
            } => {
                if limit == 0 {
                    return Err(RatewardenError::Config(
                        "sliding window limit must be greater than zero".to_string(),
                    ));
                }
                window_seconds(window)?;
                let store: Arc<dyn WindowStore> = match store {
                    Some(store) => store,
                    None => Arc::new(MemoryWindowStore::with_options(
                        self.store_options.unwrap_or_else(StoreOptions::for_windows),
                        Arc::clone(&self.clock),
                    )?),
                };
                Algorithm::SlidingWindow {
                    store,
                    limit,
                    window,
                }
            }
        };

        Ok(Limiter {
            algorithm,
            key_fn: self.key_fn.unwrap_or_else(key_by_ip),
            enforce: self.enforce,
            on_exceeded: self.on_exceeded,
            clock: self.clock,
            store_timeout: self.store_timeout,
        })
    }
}
