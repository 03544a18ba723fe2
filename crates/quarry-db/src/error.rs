//! Database error types.

use thiserror::Error;

/// Database-specific errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open or create database connection.
    #[error("failed to open database: {0}")]
    Open(String),

    /// Migration execution failed.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Database record with provided identifier not found.
    #[error("{0}")]
    NotFound(String),

    /// A state write would have moved an entity backwards.
    #[error("refused to move entity {entity_id} to {stage}: stored stage is further along")]
    StaleWrite {
        /// Entity whose write was rejected
        entity_id: String,
        /// Stage that was rejected
        stage: String,
    },

    /// Failed to decode database value.
    #[error("decode error: {0}")]
    Decode(String),

    /// JSON column could not be (de)serialised.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying `SQLx` error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
