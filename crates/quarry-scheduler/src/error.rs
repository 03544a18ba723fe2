//! Scheduler error types.
//!
//! Entity-level failures never surface here; they are recorded in
//! `last_error`. These are the loop's own bookkeeping failures.

use quarry_core::{EntityId, QuarryError};
use thiserror::Error;

/// Errors from the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// State store or bookkeeping query failed
    #[error("database error: {0}")]
    Database(#[from] quarry_db::DatabaseError),

    /// Merge could not run
    #[error("merge error: {0}")]
    Merge(#[from] quarry_merge::MergeError),

    /// A state transition was rejected
    #[error(transparent)]
    Core(#[from] QuarryError),

    /// A processing state exists without its entity row
    #[error("entity {0} not found")]
    EntityMissing(EntityId),

    /// Work on an entity panicked
    #[error("work on entity {entity_id} panicked: {message}")]
    Panicked {
        /// Entity whose work panicked
        entity_id: EntityId,
        /// Panic payload, if it was a string
        message: String,
    },
}

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
