//! Quarry Merge - from candidate records to one scored profile.
//!
//! - [`FieldValidator`]: canonicalises or rejects raw field values
//! - [`similarity_key`]: decides which values describe the same fact
//! - [`MergeEngine`]: groups, scores and picks a winner per field
//!
//! Merging is pure: the same candidate set, in any order, yields the same
//! [`MergedProfile`] byte for byte.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use quarry_core::{CandidateRecord, EntityId, MergeConfig, ProviderId};
//! use quarry_merge::MergeEngine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let entity_id = EntityId::new("acme")?;
//! let candidates = vec![
//!     CandidateRecord::new(ProviderId::new("registry")?, entity_id.clone(), 0.9, Utc::now())
//!         .with_field("full_name", "Jane Doe"),
//!     CandidateRecord::new(ProviderId::new("search")?, entity_id.clone(), 0.5, Utc::now())
//!         .with_field("full_name", "J. Doe"),
//! ];
//!
//! let profile = MergeEngine::new(MergeConfig::default())?.merge(&entity_id, &candidates)?;
//! assert_eq!(profile.value("full_name"), Some("Jane Doe"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod engine;
pub mod error;
pub mod profile;
pub mod similarity;
pub mod validator;

pub use engine::MergeEngine;
pub use error::{MergeError, Result, ValidationError};
pub use profile::{MergedProfile, ResolvedField};
pub use similarity::{similarity_key, NameKey};
pub use validator::{clean_record, CleanFields, DefaultValidator, FieldValidator};
