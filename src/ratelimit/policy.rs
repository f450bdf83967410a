//! Route policies: one independent limiter per configured route.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::clock::Clock;
use super::limiter::{
    key_by_header, key_by_ip, key_by_route_and_ip, Decision, KeyFn, Limiter, RequestInfo,
};
use crate::config::{AlgorithmConfig, EngineConfig, KeySource, PolicySpec, StoreConfig};
use crate::error::Result;

struct RouteLimiter<R> {
    route: String,
    method: Option<String>,
    limiter: Limiter<R>,
}

/// Limiters for every configured route plus an optional default.
///
/// Every limiter gets its own store, so the same client key hitting two
/// routes is counted separately per route.
pub struct LimiterSet<R> {
    routes: Vec<RouteLimiter<R>>,
    default: Option<Limiter<R>>,
}

impl<R: RequestInfo + 'static> LimiterSet<R> {
    /// Build limiters for all policies in `config`.
    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let limiter = build_limiter(&route.policy, &config.store, Arc::clone(&clock))?;
            debug!(
                route = %route.route,
                method = ?route.method,
                limiter = ?limiter,
                "Configured route limiter"
            );
            routes.push(RouteLimiter {
                route: route.route.clone(),
                method: route.method.clone(),
                limiter,
            });
        }

        let default = match &config.default_policy {
            Some(policy) => Some(build_limiter(policy, &config.store, clock)?),
            None => None,
        };

        info!(
            routes = routes.len(),
            has_default = default.is_some(),
            "Rate limit policies loaded"
        );

        Ok(Self { routes, default })
    }

    /// Find the limiter for a route and method.
    ///
    /// A policy naming the method wins over one matching any method on the
    /// same route; the default applies when no route matches.
    pub fn limiter_for(&self, route: &str, method: &str) -> Option<&Limiter<R>> {
        let mut best_match: Option<&Limiter<R>> = None;

        for entry in &self.routes {
            if entry.route != route {
                continue;
            }
            match &entry.method {
                Some(m) if m.eq_ignore_ascii_case(method) => return Some(&entry.limiter),
                Some(_) => continue,
                None => {
                    if best_match.is_none() {
                        best_match = Some(&entry.limiter);
                    }
                }
            }
        }

        best_match.or(self.default.as_ref())
    }

    /// Check `req` against the limiter for its route. `None` when unlimited.
    pub async fn check(&self, req: &R) -> Option<Decision> {
        let limiter = self.limiter_for(req.route(), req.method())?;
        Some(limiter.check(req).await)
    }

    /// Number of route limiters (the default is not counted).
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

fn key_fn_for<R: RequestInfo + 'static>(source: &KeySource) -> KeyFn<R> {
    match source {
        KeySource::Ip => key_by_ip(),
        KeySource::RouteIp => key_by_route_and_ip(),
        KeySource::Header { name } => key_by_header(name),
    }
}

fn build_limiter<R: RequestInfo + 'static>(
    policy: &PolicySpec,
    store: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Limiter<R>> {
    let builder = match policy.algorithm {
        AlgorithmConfig::TokenBucket { rate, burst } => {
            Limiter::token_bucket(rate, burst).store_options(store.bucket_options())
        }
        AlgorithmConfig::SlidingWindow { limit, window_secs } => {
            Limiter::sliding_window(limit, Duration::from_secs(window_secs))
                .store_options(store.window_options())
        }
    };

    builder
        .key(key_fn_for(&policy.key))
        .enforce(policy.enforce)
        .clock(clock)
        .build()
}
