//! Fetch layer error types.
//!
//! Provider failures are outcomes, not errors; these cover setup and cache
//! maintenance only.

use thiserror::Error;

/// Errors from the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Configuration the fetch layer cannot run with
    #[error("invalid fetch configuration: {0}")]
    InvalidConfig(String),

    /// Cache maintenance failed
    #[error("cache error: {0}")]
    Cache(#[from] quarry_cache::CacheError),
}

/// Result type alias for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
