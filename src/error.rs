//! Error types for the Turnstile admission guard.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Quota and block outcomes are not errors; they come back as
/// [`AdmissionVerdict`](crate::ratelimit::AdmissionVerdict) values.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The call was rejected before touching the store
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The backing store could not complete an operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
