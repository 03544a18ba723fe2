//! Quarry Scheduler - resumable per-entity pipeline.
//!
//! Every entity moves forward through
//! `PENDING → DISCOVERING → EXTRACTING → MERGING → QUALIFYING → DONE`
//! (or `FAILED`). The [`StageProcessor`] performs one stage of work and
//! persists the new state; the [`Scheduler`] loop claims due entities under a
//! lease and runs the processor on a bounded worker pool.
//!
//! Providers that fail transiently after an entity has moved on are retried
//! independently on their own backoff; new candidates are merged into the
//! existing profile without moving the stage.
//!
//! Everything needed to resume lives in the database, so restarting the
//! loop after a crash continues where it stopped.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod backoff;
pub mod error;
pub mod processor;
pub mod scheduler;

// Re-export commonly used types
pub use backoff::RetryPolicy;
pub use error::{Result, SchedulerError};
pub use processor::{ProviderRetry, StageProcessor, Transition};
pub use scheduler::{RoundSummary, Scheduler};
pub use tokio_util::sync::CancellationToken;
