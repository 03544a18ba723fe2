//! Quarry Database Layer
//!
//! Durable state for a batch: entities, per-entity processing state with
//! leases, candidate records, per-provider attempts, merged profiles, the
//! persistent cache tier and batch-run bookkeeping.
//!
//! # Architecture
//!
//! - **Storage**: `SQLite` through `SQLx`, WAL mode for on-disk files
//! - **Migrations**: SQL files in `migrations/`, embedded at compile time
//! - **State contract**: [`StateStore`] is the scheduler's only view of
//!   `processing_state`; writes never move an entity backwards
//!
//! # Example
//!
//! ```ignore
//! use quarry_db::{Database, StateStore};
//!
//! let db = Database::new("quarry.db").await?;
//! db.run_migrations().await?;
//! let due = db.due(chrono::Utc::now(), 32).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod attempts;
pub mod batch_runs;
pub mod cache_entries;
pub mod candidates;
mod codec;
pub mod connection;
pub mod entities;
pub mod error;
pub mod migrations;
pub mod profiles;
pub mod state;

// Re-export commonly used types
pub use attempts::{AttemptStatus, ProviderAttempt};
pub use batch_runs::{BatchRun, BatchStatus};
pub use cache_entries::CacheRow;
pub use candidates::StoredCandidate;
pub use connection::DbPool;
pub use error::{DatabaseError, Result};
pub use state::StateStore;

use quarry_core::DatabaseConfig;
use std::path::Path;

/// High-level database handle.
///
/// Cheap to clone; every clone shares the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open a database with default pool settings.
    ///
    /// # Arguments
    /// * `path` - Path to the database file (or `:memory:` for in-memory)
    ///
    /// # Errors
    /// Returns `DatabaseError` if the database cannot be opened.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, &DatabaseConfig::default()).await
    }

    /// Open a database with explicit pool settings.
    ///
    /// # Errors
    /// Returns `DatabaseError` if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let pool = DbPool::new(path, config).await?;
        Ok(Self { pool })
    }

    /// Run all pending database migrations.
    ///
    /// # Errors
    /// Returns `DatabaseError::Migration` if any migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(self.pool.pool()).await
    }

    /// Get the current schema version.
    ///
    /// # Errors
    /// Returns `DatabaseError` if the version cannot be queried.
    pub async fn get_schema_version(&self) -> Result<i64> {
        migrations::get_schema_version(self.pool.pool()).await
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.pool.pool()
    }

    /// Close the database connection gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
