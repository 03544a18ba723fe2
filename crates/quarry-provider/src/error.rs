//! Error types for provider registration and construction.
//!
//! Lookups themselves never return these: a provider maps its own failures
//! onto `CandidateOutcome`.

use thiserror::Error;

/// Errors that can occur while building or registering providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider not registered
    #[error("provider not found: {provider_id}")]
    NotFound {
        /// Provider identifier
        provider_id: String,
    },

    /// A provider with the same id is already registered
    #[error("provider already registered: {provider_id}")]
    Duplicate {
        /// Provider identifier
        provider_id: String,
    },

    /// Provider configuration is unusable
    #[error("invalid provider configuration for {provider_id}: {reason}")]
    InvalidConfig {
        /// Provider identifier
        provider_id: String,
        /// What is wrong
        reason: String,
    },

    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid identifier
    #[error("invalid provider ID: {0}")]
    InvalidId(#[from] quarry_core::QuarryError),
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
