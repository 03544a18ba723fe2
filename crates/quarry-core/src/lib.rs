//! Quarry Core - Foundation crate for the Quarry enrichment engine.
//!
//! This crate provides the shared domain types, error handling, configuration
//! management and clock abstraction that all other Quarry crates depend on.
//!
//! # Modules
//!
//! - [`error`] - Central error types using thiserror
//! - [`config`] - TOML-based configuration with XDG paths
//! - [`types`] - Shared newtypes and records (`EntityId`, `ProviderId`, `Entity`, `CandidateRecord`)
//! - [`pipeline`] - Per-entity stage machine (`Stage`, `ProcessingState`, `StageError`)
//! - [`clock`] - Wall-clock abstraction so retry timing can be tested with a fake clock
//!
//! # Example
//!
//! ```rust
//! use quarry_core::{AppConfig, Entity, EntityId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::default();
//! config.validate()?;
//!
//! let entity = Entity::new(EntityId::new("acme-001")?, "Acme Holdings")
//!     .with_website("https://acme.example");
//! assert!(entity.validate().is_ok());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, CacheConfig, CircuitBreakerConfig, DatabaseConfig, FetchConfig, GeneralConfig,
    MergeConfig, ProviderConfig, RateLimitConfig, RateLimitsConfig, SchedulerConfig,
};
pub use error::{ConfigError, ConfigResult, QuarryError, Result};
pub use pipeline::{ProcessingState, Stage, StageError, StageErrorKind};
pub use types::{CandidateRecord, Entity, EntityId, FieldKind, ProviderId};
