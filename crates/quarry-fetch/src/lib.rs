//! Quarry Fetch - rate-limited provider fan-out.
//!
//! Turns "ask every selected provider about this entity" into one call that
//! respects provider quotas and never fails as a whole:
//!
//! - [`RateLimiter`]: sliding-window admission per provider, exponential
//!   penalty when a provider signals rate limiting
//! - [`CircuitBreaker`]: stops calling a provider after repeated transient
//!   failures, probes again after a cooldown
//! - [`FetchOrchestrator`]: cache lookup, bounded concurrency, per-call
//!   timeouts, one [`ProviderOutcome`] per provider in input order
//!
//! [`summarize`] reduces the outcomes to a single [`FetchOverall`] verdict
//! for the scheduler.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod circuit_breaker;
pub mod error;
pub mod orchestrator;
pub mod rate_limiter;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use error::{FetchError, Result};
pub use orchestrator::{summarize, FetchOrchestrator, FetchOverall, ProviderOutcome};
pub use rate_limiter::{LimiterStatus, RateLimiter};
