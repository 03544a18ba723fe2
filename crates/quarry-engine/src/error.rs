//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the application shell.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(#[from] quarry_core::ConfigError),

    /// Domain validation failed
    #[error(transparent)]
    Core(#[from] quarry_core::QuarryError),

    /// State database failure
    #[error("database error: {0}")]
    Database(#[from] quarry_db::DatabaseError),

    /// A configured provider could not be built or registered
    #[error("provider error: {0}")]
    Provider(#[from] quarry_provider::ProviderError),

    /// Fetch layer could not be assembled
    #[error("fetch error: {0}")]
    Fetch(#[from] quarry_fetch::FetchError),

    /// Merge engine rejected its configuration
    #[error("merge error: {0}")]
    Merge(#[from] quarry_merge::MergeError),

    /// Scheduler loop failed on its own bookkeeping
    #[error("scheduler error: {0}")]
    Scheduler(#[from] quarry_scheduler::SchedulerError),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
