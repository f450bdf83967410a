//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::StoreOptions;

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// In-memory store tuning
    #[serde(default)]
    pub store: StoreConfig,

    /// Policy applied to requests no route policy matches
    #[serde(default)]
    pub default_policy: Option<PolicySpec>,

    /// Per-route policies
    #[serde(default)]
    pub routes: Vec<RoutePolicy>,
}

/// Eviction settings for the in-memory stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Idle seconds after which a token bucket is dropped
    #[serde(default = "default_bucket_ttl")]
    pub bucket_ttl_secs: u64,

    /// Age in seconds of a window start after which the window is dropped
    #[serde(default = "default_window_ttl")]
    pub window_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            bucket_ttl_secs: default_bucket_ttl(),
            window_ttl_secs: default_window_ttl(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_bucket_ttl() -> u64 {
    3600
}

fn default_window_ttl() -> u64 {
    7200
}

impl StoreConfig {
    /// Options for token bucket stores.
    pub fn bucket_options(&self) -> StoreOptions {
        StoreOptions {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ttl: Duration::from_secs(self.bucket_ttl_secs),
        }
    }

    /// Options for sliding window stores.
    pub fn window_options(&self) -> StoreOptions {
        StoreOptions {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ttl: Duration::from_secs(self.window_ttl_secs),
        }
    }
}

/// A policy bound to a route (and optionally a method).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Route pattern as reported by the HTTP layer
    pub route: String,
    /// Method to match; any method when absent
    #[serde(default)]
    pub method: Option<String>,
    /// The limit to apply
    pub policy: PolicySpec,
}

/// How a group of requests is limited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub algorithm: AlgorithmConfig,

    /// Reject exceeded requests; report only when false
    #[serde(default = "default_enforce")]
    pub enforce: bool,

    #[serde(default)]
    pub key: KeySource,
}

fn default_enforce() -> bool {
    true
}

/// Admission algorithm and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// `rate` tokens per second, bucket capacity `burst`
    TokenBucket { rate: f64, burst: u32 },
    /// `limit` requests per `window_secs`
    SlidingWindow { limit: u64, window_secs: u64 },
}

/// What identifies a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum KeySource {
    /// Client address
    #[default]
    Ip,
    /// Route plus client address
    RouteIp,
    /// A request header, falling back to the client address
    Header { name: String },
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatewardenError::Config(format!("Failed to parse rate limit config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.store.sweep_interval_secs, 300);
        assert_eq!(config.store.bucket_ttl_secs, 3600);
        assert_eq!(config.store.window_ttl_secs, 7200);
        assert!(config.routes.is_empty());
        assert!(config.default_policy.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  sweep_interval_secs: 60
default_policy:
  algorithm:
    type: token_bucket
    rate: 10
    burst: 20
routes:
  - route: /login
    method: POST
    policy:
      algorithm:
        type: sliding_window
        limit: 5
        window_secs: 60
      enforce: false
      key:
        by: header
        name: X-Api-Key
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.sweep_interval_secs, 60);
        assert_eq!(config.store.bucket_ttl_secs, 3600);

        let default = config.default_policy.unwrap();
        assert_eq!(default.algorithm, AlgorithmConfig::TokenBucket { rate: 10.0, burst: 20 });
        assert!(default.enforce);
        assert_eq!(default.key, KeySource::Ip);

        let route = &config.routes[0];
        assert_eq!(route.route, "/login");
        assert_eq!(route.method.as_deref(), Some("POST"));
        assert_eq!(
            route.policy.algorithm,
            AlgorithmConfig::SlidingWindow {
                limit: 5,
                window_secs: 60
            }
        );
        assert!(!route.policy.enforce);
        assert_eq!(
            route.policy.key,
            KeySource::Header {
                name: "X-Api-Key".to_string()
            }
        );
    }

    #[test]
    fn test_store_options() {
        let store = StoreConfig::default();
        assert_eq!(store.bucket_options(), StoreOptions::for_buckets());
        assert_eq!(store.window_options(), StoreOptions::for_windows());
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let result = EngineConfig::from_yaml("routes: [ { route: /x, policy: { algorithm: { type: leaky } } } ]");
        assert!(matches!(result, Err(RatewardenError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = EngineConfig::from_file("/nonexistent/ratewarden.yaml");
        assert!(matches!(result, Err(RatewardenError::Io(_))));
    }
}
