//! Per-provider sliding-window rate limiter.
//!
//! Each provider owns a log of admission instants. `acquire` prunes entries
//! older than the window and admits the caller while the log is below the
//! effective limit; otherwise it sleeps until the oldest admission leaves the
//! window. Buckets sit behind their own async mutex, so a throttled provider
//! never delays another.
//!
//! When a provider signals rate limiting, `penalize` raises the bucket's
//! penalty level: the effective limit halves per level, admissions are held
//! for the provider's retry-after hint, and the penalty lapses after an
//! exponentially growing cooldown.

use quarry_core::{ProviderId, RateLimitConfig, RateLimitsConfig};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Highest penalty level; the limit never drops below `limit >> MAX_PENALTY_LEVEL`.
const MAX_PENALTY_LEVEL: u32 = 8;

#[derive(Debug)]
struct Bucket {
    limit: u32,
    window: Duration,
    admissions: VecDeque<Instant>,
    penalty_level: u32,
    penalty_expires_at: Option<Instant>,
    hold_until: Option<Instant>,
}

impl Bucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.limit.max(1),
            window: config.window(),
            admissions: VecDeque::new(),
            penalty_level: 0,
            penalty_expires_at: None,
            hold_until: None,
        }
    }

    fn effective_limit(&self) -> u32 {
        (self.limit >> self.penalty_level).max(1)
    }

    fn refresh(&mut self, now: Instant) {
        if self.penalty_expires_at.is_some_and(|at| at <= now) {
            self.penalty_level = 0;
            self.penalty_expires_at = None;
        }
        if self.hold_until.is_some_and(|at| at <= now) {
            self.hold_until = None;
        }
        while self
            .admissions
            .front()
            .is_some_and(|admitted| now.duration_since(*admitted) >= self.window)
        {
            self.admissions.pop_front();
        }
    }

    /// Admit now, or report how long to wait before trying again.
    fn try_admit(&mut self, now: Instant) -> Result<(), Duration> {
        self.refresh(now);

        if let Some(hold_until) = self.hold_until {
            return Err(hold_until - now);
        }

        let limit = self.effective_limit() as usize;
        if self.admissions.len() < limit {
            self.admissions.push_back(now);
            return Ok(());
        }

        // Admissions beyond a freshly lowered limit must all age out first.
        let blocking = self.admissions.len() - limit;
        let wait = self
            .admissions
            .get(blocking)
            .map_or(self.window, |admitted| (*admitted + self.window).saturating_duration_since(now));
        Err(wait)
    }
}

/// Point-in-time view of one provider's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStatus {
    /// Configured admissions per window
    pub limit: u32,
    /// Limit after penalties
    pub effective_limit: u32,
    /// Admissions still inside the window
    pub in_window: usize,
    /// Current penalty level (0 = none)
    pub penalty_level: u32,
}

/// Rate limiter keyed by provider id.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitsConfig,
    buckets: Mutex<HashMap<ProviderId, Arc<tokio::sync::Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Create a limiter using per-provider limits or the configured default.
    #[must_use]
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a call to `provider_id` may be made, then record it.
    pub async fn acquire(&self, provider_id: &ProviderId) {
        let bucket = self.bucket(provider_id);
        loop {
            let wait = {
                let mut bucket = bucket.lock().await;
                match bucket.try_admit(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };

            let wait = wait + self.jitter();
            debug!(provider_id = %provider_id, wait = ?wait, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Apply an exponential penalty after `provider_id` signalled rate limiting.
    pub async fn penalize(&self, provider_id: &ProviderId, retry_after: Option<Duration>) {
        let bucket = self.bucket(provider_id);
        let mut bucket = bucket.lock().await;
        let now = Instant::now();
        bucket.refresh(now);

        bucket.penalty_level = (bucket.penalty_level + 1).min(MAX_PENALTY_LEVEL);
        let penalty = self.penalty_duration(bucket.penalty_level);
        bucket.penalty_expires_at = Some(now + penalty);

        if let Some(retry_after) = retry_after {
            let hold_until = now + retry_after;
            bucket.hold_until = Some(bucket.hold_until.map_or(hold_until, |at| at.max(hold_until)));
        }

        warn!(
            provider_id = %provider_id,
            level = bucket.penalty_level,
            effective_limit = bucket.effective_limit(),
            penalty_secs = penalty.as_secs(),
            "provider rate limited us, penalty applied"
        );
    }

    /// Current bucket state for `provider_id`.
    pub async fn status(&self, provider_id: &ProviderId) -> LimiterStatus {
        let bucket = self.bucket(provider_id);
        let mut bucket = bucket.lock().await;
        bucket.refresh(Instant::now());
        LimiterStatus {
            limit: bucket.limit,
            effective_limit: bucket.effective_limit(),
            in_window: bucket.admissions.len(),
            penalty_level: bucket.penalty_level,
        }
    }

    fn bucket(&self, provider_id: &ProviderId) -> Arc<tokio::sync::Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().expect("acquire rate limiter buckets lock");
        buckets
            .entry(provider_id.clone())
            .or_insert_with(|| {
                let config = self
                    .config
                    .providers
                    .get(provider_id.as_str())
                    .copied()
                    .unwrap_or(self.config.default);
                Arc::new(tokio::sync::Mutex::new(Bucket::new(config)))
            })
            .clone()
    }

    fn penalty_duration(&self, level: u32) -> Duration {
        let factor = 1u64 << level.saturating_sub(1).min(32);
        let secs = self
            .config
            .base_penalty_secs
            .saturating_mul(factor)
            .min(self.config.max_penalty_secs);
        Duration::from_secs(secs)
    }

    fn jitter(&self) -> Duration {
        if self.config.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.max_jitter_ms))
    }
}
