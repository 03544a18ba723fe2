//! Retry timing.

use chrono::{DateTime, Utc};
use quarry_core::SchedulerConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap, jitter and a retry-after floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First retry delay
    pub base: Duration,
    /// Longest delay before jitter
    pub max: Duration,
    /// Upper bound on the random delay added to each retry
    pub jitter: Duration,
    /// Attempts per stage before the entity fails
    pub max_stage_attempts: u32,
    /// Attempts per provider before it is given up
    pub max_provider_attempts: u32,
}

impl RetryPolicy {
    /// Policy from scheduler configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base: Duration::from_secs(config.retry_base_secs),
            max: Duration::from_secs(config.retry_max_secs),
            jitter: Duration::from_millis(config.retry_jitter_ms),
            max_stage_attempts: config.max_stage_attempts.max(1),
            max_provider_attempts: config.max_provider_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// `min(base * 2^attempt, max)`, raised to `hint` when the provider asked
    /// for longer, plus up to `jitter`.
    #[must_use]
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponential = self
            .base
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max)
            .min(self.max);
        let floor = hint.map_or(exponential, |hint| exponential.max(hint));
        floor + self.random_jitter()
    }

    /// Absolute time of the next retry.
    #[must_use]
    pub fn retry_at(&self, now: DateTime<Utc>, attempt: u32, hint: Option<Duration>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempt, hint))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a stage that has failed `attempts` times may try again.
    #[must_use]
    pub fn stage_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_stage_attempts
    }

    /// Whether a provider that has been tried `attempts` times may try again.
    #[must_use]
    pub fn provider_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_provider_attempts
    }

    fn random_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
