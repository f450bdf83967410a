//! Error types for the Ratewarden engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// An exceeded limit is never an error; it is reported through
/// [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store failures (remote backend unreachable, bad reply, ...)
    #[error("Store error: {0}")]
    Store(String),

    /// The caller cancelled the operation before the store answered
    #[error("Store operation cancelled")]
    Cancelled,

    /// The store did not answer within the configured timeout
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
