//! Quarry Provider Cache
//!
//! Caches raw provider responses per `(provider, entity)` so repeated
//! lookups inside the TTL never reach the provider.
//!
//! # Tiers
//!
//! 1. **Memory**: sharded TTL map, bounded, cleared on restart
//! 2. **Persistent**: `cache_entries` table in the batch database
//!
//! Values larger than `compress_threshold_bytes` are deflated once and
//! stored compressed in both tiers. Any cache failure degrades to a miss.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod compression;
pub mod error;
pub mod memory;
pub mod tiered;

pub use compression::StoredValue;
pub use error::{CacheError, Result};
pub use memory::MemoryTier;
pub use tiered::{CacheStats, ProviderCache};
