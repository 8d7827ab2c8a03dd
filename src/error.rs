//! Error types for admission control.

use std::time::Duration;

use thiserror::Error;

/// Main error type for admission operations.
///
/// The in-memory limiters never fail a decision; errors come from
/// configuration and from the remote counter store.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis communication errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Non-Redis store failures
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A store round trip exceeded its deadline
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled a pending store operation
    #[error("Store operation cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
