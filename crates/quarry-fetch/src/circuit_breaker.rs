//! Per-provider circuit breaker.
//!
//! ```text
//!  Closed ──K consecutive transient/rate-limited──▶ Open
//!    ▲                                               │ cooldown
//!    └──────── probe settles ◀── HalfOpen ◀──────────┘
//!                                  │ probe fails
//!                                  └──────────▶ Open
//! ```

use quarry_core::{CircuitBreakerConfig, ProviderId};
use quarry_provider::CandidateOutcome;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are short-circuited
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call
    Allowed,
    /// The single probe after a cooldown
    Probe,
    /// Circuit open; do not call the provider before `retry_in` has passed
    Rejected {
        /// Time until the next probe may be admitted
        retry_in: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_started: Instant },
}

/// Circuit breakers for every provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<ProviderId, Breaker>>,
}

impl CircuitBreaker {
    /// Create breakers with the configured threshold and cooldown.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Ask whether a call to `provider_id` may be made now.
    pub fn admit(&self, provider_id: &ProviderId) -> Admission {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("acquire circuit breaker lock");
        let breaker = breakers
            .entry(provider_id.clone())
            .or_insert(Breaker::Closed {
                consecutive_failures: 0,
            });

        match *breaker {
            Breaker::Closed { .. } => Admission::Allowed,
            Breaker::Open { until } if now < until => Admission::Rejected {
                retry_in: until - now,
            },
            Breaker::Open { .. } => {
                *breaker = Breaker::HalfOpen { probe_started: now };
                info!(provider_id = %provider_id, "circuit half-open, sending probe");
                Admission::Probe
            }
            // A probe that never reported back (cancelled call) is replaced
            // once a full cooldown has passed.
            Breaker::HalfOpen { probe_started } if now.duration_since(probe_started) < self.cooldown => {
                Admission::Rejected {
                    retry_in: self.cooldown - now.duration_since(probe_started),
                }
            }
            Breaker::HalfOpen { .. } => {
                *breaker = Breaker::HalfOpen { probe_started: now };
                Admission::Probe
            }
        }
    }

    /// Feed a provider outcome back into its breaker.
    pub fn record(&self, provider_id: &ProviderId, outcome: &CandidateOutcome) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("acquire circuit breaker lock");
        let breaker = breakers
            .entry(provider_id.clone())
            .or_insert(Breaker::Closed {
                consecutive_failures: 0,
            });

        if !outcome.is_retryable() {
            if matches!(breaker, Breaker::HalfOpen { .. }) {
                info!(provider_id = %provider_id, "probe answered, circuit closed");
            }
            *breaker = Breaker::Closed {
                consecutive_failures: 0,
            };
            return;
        }

        *breaker = match *breaker {
            Breaker::Closed {
                consecutive_failures,
            } if consecutive_failures + 1 >= self.failure_threshold => {
                warn!(
                    provider_id = %provider_id,
                    failures = consecutive_failures + 1,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened"
                );
                Breaker::Open {
                    until: now + self.cooldown,
                }
            }
            Breaker::Closed {
                consecutive_failures,
            } => Breaker::Closed {
                consecutive_failures: consecutive_failures + 1,
            },
            Breaker::HalfOpen { .. } => {
                warn!(provider_id = %provider_id, "probe failed, circuit reopened");
                Breaker::Open {
                    until: now + self.cooldown,
                }
            }
            open @ Breaker::Open { .. } => open,
        };
    }

    /// Current state of `provider_id`'s breaker.
    #[must_use]
    pub fn state(&self, provider_id: &ProviderId) -> CircuitState {
        let breakers = self.breakers.lock().expect("acquire circuit breaker lock");
        match breakers.get(provider_id) {
            None | Some(Breaker::Closed { .. }) => CircuitState::Closed,
            Some(Breaker::Open { .. }) => CircuitState::Open,
            Some(Breaker::HalfOpen { .. }) => CircuitState::HalfOpen,
        }
    }
}
