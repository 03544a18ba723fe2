//! Connection pool setup.
//!
//! On-disk databases run in WAL mode with a busy timeout so the scheduler's
//! workers can write concurrently. `:memory:` databases get a single
//! connection that is never recycled, since every new connection would see
//! an empty database.

use crate::error::{DatabaseError, Result};
use quarry_core::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// `SQLite` connection pool.
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: Pool<Sqlite>,
}

impl DbPool {
    /// Open (creating if missing) the database at `path`.
    ///
    /// # Errors
    /// Returns `DatabaseError::Open` if the path is not valid UTF-8, parent
    /// directories cannot be created, or the pool cannot connect.
    pub async fn new(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or_else(|| {
            DatabaseError::Open("invalid database path: not valid UTF-8".to_string())
        })?;
        let in_memory = path_str == ":memory:";

        if !in_memory {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut connect_options = SqliteConnectOptions::from_str(path_str)
            .map_err(|e| DatabaseError::Open(format!("invalid connection string: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            connect_options = connect_options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DatabaseError::Open(format!("failed to initialize pool: {e}")))?;

        tracing::info!(path = path_str, in_memory, "database pool created");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying `SQLx` pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database pool closed");
    }

    /// Run a trivial query to confirm the database is reachable.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
