//! Core error types for the Quarry engine.
//!
//! This module defines the central error type shared by the domain types
//! and the configuration error type used while loading `config.toml`.

use thiserror::Error;

/// Central error type for core Quarry operations.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Configuration errors (file loading, parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors (invalid identifiers, malformed entities)
    #[error("validation error: {0}")]
    Validation(String),

    /// A stage transition that would move an entity backwards
    #[error("invalid stage transition from {from} to {to}")]
    InvalidTransition {
        /// Stage the entity is currently in
        from: String,
        /// Stage that was requested
        to: String,
    },

    /// Serialization errors for stored JSON payloads
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to determine config directory path
    #[error("could not determine config directory (XDG base directories not available)")]
    NoConfigDir,

    /// Failed to parse TOML
    #[error("failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading/writing config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// Reason for invalidity
        reason: String,
    },
}

/// Result type alias using `QuarryError`.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
