//! Merge error types.

use quarry_core::EntityId;
use thiserror::Error;

/// Errors from the merge engine.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A candidate belongs to another entity
    #[error("candidate for entity {found} passed to merge of {expected}")]
    EntityMismatch {
        /// Entity being merged
        expected: EntityId,
        /// Entity on the offending candidate
        found: EntityId,
    },

    /// Scoring inputs the engine cannot use
    #[error("invalid merge configuration: {0}")]
    InvalidConfig(String),

    /// Profile could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single field value rejected by a validator.
///
/// Only the field is dropped; the rest of the record survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field} value '{value}': {reason}")]
pub struct ValidationError {
    /// Field name
    pub field: String,
    /// Rejected raw value
    pub value: String,
    /// Why it was rejected
    pub reason: String,
}

impl ValidationError {
    /// Create a validation error.
    #[must_use]
    pub fn new(field: &str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
