//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// An over-limit request is not an error: it is a normal
/// [`Decision`](crate::ratelimit::Decision) with `admitted == false`.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Unknown policy name, invalid or contradictory policy parameters,
    /// or an unreadable configuration document.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared window store could not be reached or answered garbage.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
