//! Quarry Engine - application shell for the enrichment pipeline.
//!
//! Wires configuration, the state database, the provider registry, the
//! shared fetch services and the merge engine into one [`Engine`], then
//! drives a batch to completion with the scheduler.
//!
//! # Example
//!
//! ```ignore
//! use quarry_core::{AppConfig, Entity, EntityId};
//! use quarry_engine::{init_tracing, CancellationToken, Engine};
//!
//! let config = AppConfig::load_with_env()?;
//! init_tracing(&config.general.log_filter);
//!
//! let engine = Engine::open(config).await?;
//! engine.enqueue(&[Entity::new(EntityId::new("acme-001")?, "Acme Holdings")]).await?;
//! let run = engine.run(CancellationToken::new()).await?;
//! for report in engine.reports().await? {
//!     println!("{} {}", report.entity_id, report.stage);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod engine;
pub mod error;
pub mod logging;
pub mod report;

// Re-export commonly used types
pub use engine::{Engine, EnqueueSummary};
pub use error::{EngineError, Result};
pub use logging::init_tracing;
pub use quarry_scheduler::CancellationToken;
pub use report::EntityReport;
