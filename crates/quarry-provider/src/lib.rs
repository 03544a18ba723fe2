//! Quarry Provider - uniform contract for enrichment sources.
//!
//! Every external source (directory scraper, search lookup, registry API,
//! website crawler) is a [`Provider`]. The orchestrator only ever sees the
//! trait and the [`CandidateOutcome`] taxonomy, so new sources are added by
//! implementing the trait, never by branching on provider names.
//!
//! # Outcome taxonomy
//!
//! ```text
//! lookup(entity) ─┬─ Success(records)     → merged
//!                 ├─ EmptyResult          → nothing found, not an error
//!                 ├─ TransientFailure     → retried with backoff
//!                 ├─ PermanentFailure     → recorded, never retried
//!                 └─ RateLimited(hint)    → limiter penalised, retried later
//! ```
//!
//! # Example
//!
//! ```rust
//! use quarry_core::{Entity, EntityId, ProviderId};
//! use quarry_provider::{ProviderDescriptor, ProviderRegistry, ScriptedProvider};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ProviderRegistry::new();
//! let descriptor = ProviderDescriptor::new(ProviderId::new("directory")?, 0.6);
//! registry.register(Arc::new(ScriptedProvider::new(descriptor)))?;
//!
//! let entity = Entity::new(EntityId::new("acme-001")?, "Acme Holdings");
//! assert_eq!(registry.select_for(&entity).len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod provider;
pub mod providers;
pub mod registry;

// Re-export commonly used types
pub use error::{ProviderError, Result};
pub use provider::{CandidateOutcome, Provider, ProviderDescriptor};
pub use providers::{HttpJsonProvider, ScriptedProvider};
pub use registry::ProviderRegistry;
