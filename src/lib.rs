//! Ratewarden - Per-key Admission Control
//!
//! This crate implements the admission-control engine behind HTTP rate
//! limiting middleware. Requests are keyed (by IP, user, API key, ...) and
//! admitted or rejected by either a continuous-refill token bucket or a
//! two-window sliding window estimate. Per-key state lives in pluggable
//! stores; the in-memory stores evict idle keys in the background.

pub mod config;
pub mod error;
pub mod ratelimit;
