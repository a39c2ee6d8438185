//! Error types for the windowed rate limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RatelimitError {
    /// Configuration-related errors, raised at construction
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors surfaced by the backing store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RatelimitError>;
