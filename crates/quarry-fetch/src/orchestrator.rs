//! Provider fan-out for one entity.
//!
//! Every selected provider is queried concurrently. Per provider the path is:
//! cache → circuit breaker → rate limiter → global call semaphore → lookup
//! under a timeout. A cache hit short-circuits everything after it. A
//! provider that panics inside `lookup` is reported as a transient failure.

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::{FetchError, Result};
use crate::rate_limiter::RateLimiter;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use quarry_cache::ProviderCache;
use quarry_core::{AppConfig, Entity, ProviderId};
use quarry_provider::{CandidateOutcome, Provider};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Outcome of one provider for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    /// Provider that was asked
    pub provider_id: ProviderId,
    /// What it answered
    pub outcome: CandidateOutcome,
    /// Whether the answer came from the cache
    pub from_cache: bool,
    /// Set when the circuit breaker rejected the call: time until the
    /// breaker admits its next probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_open_for: Option<Duration>,
}

/// Reduction of all provider outcomes for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOverall {
    /// At least one provider produced candidates
    Candidates,
    /// Nothing found and nothing left to retry
    Empty,
    /// Nothing found yet, but some providers can be retried
    Retryable,
    /// Every provider failed permanently
    AllPermanent,
}

/// Reduce per-provider outcomes to one verdict.
#[must_use]
pub fn summarize(outcomes: &[ProviderOutcome]) -> FetchOverall {
    if outcomes.iter().any(|o| o.outcome.is_success()) {
        FetchOverall::Candidates
    } else if outcomes.iter().any(|o| o.outcome.is_retryable()) {
        FetchOverall::Retryable
    } else if !outcomes.is_empty() && outcomes.iter().all(|o| o.outcome.is_permanent()) {
        FetchOverall::AllPermanent
    } else {
        FetchOverall::Empty
    }
}

/// Rate-limited, circuit-broken, cached provider fan-out.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ProviderCache>,
    calls: Arc<Semaphore>,
    call_timeout: Duration,
}

impl FetchOrchestrator {
    /// Assemble an orchestrator from its parts.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidConfig` if `max_concurrent_calls` is zero.
    pub fn new(
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ProviderCache>,
        max_concurrent_calls: usize,
        call_timeout: Duration,
    ) -> Result<Self> {
        if max_concurrent_calls == 0 {
            return Err(FetchError::InvalidConfig(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            limiter,
            breaker,
            cache,
            calls: Arc::new(Semaphore::new(max_concurrent_calls)),
            call_timeout,
        })
    }

    /// Build limiter and breaker from configuration around an existing cache.
    ///
    /// # Errors
    /// Returns `FetchError::InvalidConfig` if the fetch settings are unusable.
    pub fn from_config(config: &AppConfig, cache: Arc<ProviderCache>) -> Result<Self> {
        Self::new(
            Arc::new(RateLimiter::new(config.rate_limits.clone())),
            Arc::new(CircuitBreaker::new(&config.circuit_breaker)),
            cache,
            config.fetch.max_concurrent_calls,
            config.fetch.call_timeout(),
        )
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The shared circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The shared provider cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    /// Query every provider for `entity`, concurrently.
    ///
    /// Returns one outcome per provider in the order given. Never fails: a
    /// provider's failure is its outcome.
    pub async fn fetch_candidates(
        &self,
        entity: &Entity,
        providers: &[Arc<dyn Provider>],
    ) -> Vec<ProviderOutcome> {
        let mut pending: FuturesUnordered<_> = providers
            .iter()
            .enumerate()
            .map(|(index, provider)| async move { (index, self.fetch_one(entity, provider.as_ref()).await) })
            .collect();

        let mut slots: Vec<Option<ProviderOutcome>> = vec![None; providers.len()];
        while let Some((index, outcome)) = pending.next().await {
            slots[index] = Some(outcome);
        }

        let outcomes: Vec<ProviderOutcome> = slots.into_iter().flatten().collect();

        info!(
            entity_id = %entity.entity_id,
            providers = outcomes.len(),
            succeeded = outcomes.iter().filter(|o| o.outcome.is_success()).count(),
            overall = ?summarize(&outcomes),
            "fetched candidates"
        );
        outcomes
    }

    /// Remove stale cache entries.
    ///
    /// # Errors
    /// Returns `FetchError::Cache` if the persistent tier cannot be purged.
    pub async fn purge_cache(&self) -> Result<u64> {
        Ok(self.cache.purge_expired().await?)
    }

    async fn fetch_one(&self, entity: &Entity, provider: &dyn Provider) -> ProviderOutcome {
        let provider_id = provider.id().clone();
        let cache_key = entity.cache_key();

        if let Some(outcome) = self.cached(&provider_id, &cache_key).await {
            debug!(entity_id = %entity.entity_id, provider_id = %provider_id, "cache hit");
            return ProviderOutcome {
                provider_id,
                outcome,
                from_cache: true,
                circuit_open_for: None,
            };
        }

        if let Admission::Rejected { retry_in } = self.breaker.admit(&provider_id) {
            debug!(
                entity_id = %entity.entity_id,
                provider_id = %provider_id,
                retry_in = ?retry_in,
                "circuit open, skipping call"
            );
            return ProviderOutcome {
                provider_id,
                outcome: CandidateOutcome::PermanentFailure("circuit-open".to_string()),
                from_cache: false,
                circuit_open_for: Some(retry_in),
            };
        }

        self.limiter.acquire(&provider_id).await;

        let outcome = match self.calls.acquire().await {
            Ok(_permit) => {
                let call = AssertUnwindSafe(provider.lookup(entity)).catch_unwind();
                match tokio::time::timeout(self.call_timeout, call).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(payload)) => CandidateOutcome::TransientFailure(format!(
                        "provider panicked: {}",
                        panic_message(&*payload)
                    )),
                    Err(_) => CandidateOutcome::TransientFailure(format!(
                        "timeout after {}s",
                        self.call_timeout.as_secs_f64()
                    )),
                }
            }
            Err(_) => CandidateOutcome::TransientFailure("provider call pool closed".to_string()),
        };

        self.breaker.record(&provider_id, &outcome);

        match &outcome {
            CandidateOutcome::RateLimited(retry_after) => {
                self.limiter.penalize(&provider_id, *retry_after).await;
            }
            CandidateOutcome::Success(_) | CandidateOutcome::EmptyResult => {
                self.store(&provider_id, &cache_key, &outcome).await;
            }
            CandidateOutcome::TransientFailure(reason) | CandidateOutcome::PermanentFailure(reason) => {
                warn!(
                    entity_id = %entity.entity_id,
                    provider_id = %provider_id,
                    outcome = outcome.label(),
                    reason = %reason,
                    "provider call failed"
                );
            }
        }

        ProviderOutcome {
            provider_id,
            outcome,
            from_cache: false,
            circuit_open_for: None,
        }
    }

    async fn cached(&self, provider_id: &ProviderId, key: &str) -> Option<CandidateOutcome> {
        let bytes = self.cache.get(provider_id, key).await?;
        match serde_json::from_slice::<CandidateOutcome>(&bytes) {
            Ok(outcome) if outcome.is_settled() => Some(outcome),
            Ok(_) => None,
            Err(e) => {
                warn!(provider_id = %provider_id, key, error = %e, "undecodable cache entry ignored");
                None
            }
        }
    }

    async fn store(&self, provider_id: &ProviderId, key: &str, outcome: &CandidateOutcome) {
        match serde_json::to_vec(outcome) {
            Ok(bytes) => self.cache.put(provider_id, key, &bytes, None).await,
            Err(e) => warn!(provider_id = %provider_id, error = %e, "failed to encode outcome for cache"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
