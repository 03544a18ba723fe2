//! Cache error types.
//!
//! These never reach a fetch: the tiered cache logs them and reports a miss.

use thiserror::Error;

/// Errors from the cache tiers.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Deflate encoding or decoding failed
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Persistent tier failed
    #[error("persistent tier error: {0}")]
    Database(#[from] quarry_db::DatabaseError),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
