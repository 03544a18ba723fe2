//! One stage transition for one entity.
//!
//! | Stage         | Work recorded before advancing                         |
//! |---------------|--------------------------------------------------------|
//! | `PENDING`     | entity validated, provider plan stored                 |
//! | `DISCOVERING` | unsettled providers fetched, outcomes and raw records  |
//! | `EXTRACTING`  | validated `clean_fields` for every candidate           |
//! | `MERGING`     | merged profile                                         |
//! | `QUALIFYING`  | qualification stored on the profile                    |
//!
//! Work is idempotent per stage, so a crash between the work and the state
//! save only repeats the stage.

use crate::backoff::RetryPolicy;
use crate::error::{Result, SchedulerError};
use crate::scheduler::panic_message;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use quarry_core::{
    CandidateRecord, Clock, Entity, EntityId, ProcessingState, ProviderId, Stage, StageError, StageErrorKind,
};
use quarry_db::{attempts, candidates, entities, profiles, AttemptStatus, Database, ProviderAttempt, StateStore};
use quarry_fetch::{FetchOrchestrator, ProviderOutcome};
use quarry_merge::{clean_record, MergeEngine, MergedProfile};
use quarry_provider::{CandidateOutcome, Provider, ProviderRegistry};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of processing one entity's current stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Entity processed
    pub entity_id: EntityId,
    /// Stage before processing
    pub from: Stage,
    /// Stage after processing
    pub to: Stage,
    /// Whether the stage failed retryably and was rescheduled
    pub retry_scheduled: bool,
}

/// Result of one independent provider retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRetry {
    /// Entity the provider was retried for
    pub entity_id: EntityId,
    /// Provider retried
    pub provider_id: ProviderId,
    /// Attempt status after the retry
    pub status: AttemptStatus,
    /// Whether the entity's profile was recomputed
    pub profile_recomputed: bool,
}

enum StageOutcome {
    Advance,
    Retry {
        error: StageError,
        retry_at: DateTime<Utc>,
    },
    Fail(StageError),
}

/// Executes stage work against the database, providers and merge engine.
pub struct StageProcessor {
    db: Database,
    registry: ProviderRegistry,
    fetch: FetchOrchestrator,
    merge: MergeEngine,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl StageProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        db: Database,
        registry: ProviderRegistry,
        fetch: FetchOrchestrator,
        merge: MergeEngine,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            registry,
            fetch,
            merge,
            policy,
            clock,
        }
    }

    /// The retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process the current stage of `state` and persist the new state.
    ///
    /// Stage work failures are recorded on the state; only a failure to
    /// save the state itself is returned as an error.
    pub async fn process(&self, mut state: ProcessingState) -> Result<Transition> {
        let from = state.stage;
        if from.is_terminal() {
            return Ok(Transition {
                entity_id: state.entity_id,
                from,
                to: from,
                retry_scheduled: false,
            });
        }

        let failure = match AssertUnwindSafe(self.run_stage(&state)).catch_unwind().await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!("stage work panicked: {}", panic_message(&*payload))),
        };
        let outcome = failure.unwrap_or_else(|message| {
            warn!(entity_id = %state.entity_id, stage = %from, error = %message, "stage work failed");
            StageOutcome::Retry {
                error: StageError::new(StageErrorKind::Transient, from, message),
                retry_at: self.policy.retry_at(self.clock.now(), state.attempt_count, None),
            }
        });

        let now = self.clock.now();
        let mut retry_scheduled = false;
        match outcome {
            StageOutcome::Advance => {
                let next = from.next().unwrap_or(Stage::Done);
                state.advance(next, now)?;
            }
            StageOutcome::Retry { error, retry_at } => {
                if self.policy.stage_exhausted(state.attempt_count + 1) {
                    warn!(entity_id = %state.entity_id, stage = %from, error = %error, "stage attempts exhausted");
                    state.fail(error, now)?;
                } else {
                    debug!(entity_id = %state.entity_id, stage = %from, retry_at = %retry_at, "stage retry scheduled");
                    state.schedule_retry(error, retry_at, now);
                    retry_scheduled = true;
                }
            }
            StageOutcome::Fail(error) => {
                warn!(entity_id = %state.entity_id, stage = %from, error = %error, "entity failed");
                state.fail(error, now)?;
            }
        }

        if state.stage == Stage::Failed {
            let reason = state
                .last_error
                .as_ref()
                .map_or_else(|| "entity failed".to_string(), ToString::to_string);
            attempts::abandon_unsettled(self.db.pool(), &state.entity_id, &reason, now).await?;
        }

        self.db.save(&state).await?;

        info!(entity_id = %state.entity_id, from = %from, to = %state.stage, "stage processed");
        Ok(Transition {
            entity_id: state.entity_id,
            from,
            to: state.stage,
            retry_scheduled,
        })
    }

    /// Retry one provider independently of the entity's stage.
    ///
    /// New candidates for an entity already past `EXTRACTING` are extracted
    /// and merged into its profile; the stage does not change.
    pub async fn retry_provider(&self, mut attempt: ProviderAttempt) -> Result<ProviderRetry> {
        let entity = self.load_entity(&attempt.entity_id).await?;
        let state = self
            .db
            .load(&attempt.entity_id)
            .await?
            .ok_or_else(|| SchedulerError::EntityMissing(attempt.entity_id.clone()))?;

        let fetched = match self.registry.get(&attempt.provider_id) {
            Ok(provider) => self.fetch.fetch_candidates(&entity, &[provider]).await.pop(),
            Err(e) => {
                warn!(provider_id = %attempt.provider_id, error = %e, "retried provider is no longer registered");
                None
            }
        };

        let (outcome, circuit_open_for) = fetched.map_or_else(
            || (CandidateOutcome::PermanentFailure("provider not registered".to_string()), None),
            |o| (o.outcome, o.circuit_open_for),
        );
        self.record_attempt(&mut attempt, &outcome, circuit_open_for).await?;

        let profile_recomputed = outcome.is_success()
            && state.stage != Stage::Failed
            && state.stage.rank() > Stage::Extracting.rank();
        if profile_recomputed {
            self.extract(&entity.entity_id).await?;
            self.merge_profile(&entity.entity_id, state.stage == Stage::Done).await?;
        }

        info!(
            entity_id = %attempt.entity_id,
            provider_id = %attempt.provider_id,
            status = %attempt.status,
            profile_recomputed,
            "provider retry processed"
        );
        Ok(ProviderRetry {
            entity_id: attempt.entity_id,
            provider_id: attempt.provider_id,
            status: attempt.status,
            profile_recomputed,
        })
    }

    async fn run_stage(&self, state: &ProcessingState) -> Result<StageOutcome> {
        match state.stage {
            Stage::Pending => self.plan(&state.entity_id).await,
            Stage::Discovering => self.discover(state).await,
            Stage::Extracting => {
                self.extract(&state.entity_id).await?;
                Ok(StageOutcome::Advance)
            }
            Stage::Merging => {
                self.merge_profile(&state.entity_id, false).await?;
                Ok(StageOutcome::Advance)
            }
            Stage::Qualifying => {
                self.qualify(&state.entity_id).await?;
                Ok(StageOutcome::Advance)
            }
            Stage::Done | Stage::Failed => Ok(StageOutcome::Advance),
        }
    }

    async fn plan(&self, entity_id: &EntityId) -> Result<StageOutcome> {
        let Some(entity) = entities::get_entity(self.db.pool(), entity_id).await? else {
            return Ok(StageOutcome::Fail(StageError::new(
                StageErrorKind::Permanent,
                Stage::Pending,
                format!("entity {entity_id} not found"),
            )));
        };

        if let Err(e) = entity.validate() {
            return Ok(StageOutcome::Fail(StageError::new(
                StageErrorKind::Validation,
                Stage::Pending,
                e.to_string(),
            )));
        }

        let plan: Vec<ProviderId> = self
            .registry
            .select_for(&entity)
            .iter()
            .map(|provider| provider.id().clone())
            .collect();
        attempts::plan_attempts(self.db.pool(), entity_id, &plan, self.clock.now()).await?;

        debug!(entity_id = %entity_id, providers = plan.len(), "provider plan recorded");
        Ok(StageOutcome::Advance)
    }

    async fn discover(&self, state: &ProcessingState) -> Result<StageOutcome> {
        let entity = self.load_entity(&state.entity_id).await?;
        let mut attempts = attempts::list_attempts(self.db.pool(), &entity.entity_id).await?;
        let now = self.clock.now();

        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        let mut asked: Vec<usize> = Vec::new();
        for (index, attempt) in attempts.iter_mut().enumerate() {
            let due = match attempt.status {
                AttemptStatus::Planned => true,
                AttemptStatus::RetryPending => attempt.next_retry_at.map_or(true, |at| at <= now),
                AttemptStatus::Succeeded | AttemptStatus::Empty | AttemptStatus::Failed => false,
            };
            if !due {
                continue;
            }
            match self.registry.get(&attempt.provider_id) {
                Ok(provider) => {
                    providers.push(provider);
                    asked.push(index);
                }
                Err(e) => {
                    warn!(provider_id = %attempt.provider_id, error = %e, "planned provider is no longer registered");
                    let outcome = CandidateOutcome::PermanentFailure("provider not registered".to_string());
                    self.record_attempt(attempt, &outcome, None).await?;
                }
            }
        }

        let outcomes: Vec<ProviderOutcome> = self.fetch.fetch_candidates(&entity, &providers).await;
        let mut rate_limited = false;
        for (index, provider_outcome) in asked.into_iter().zip(&outcomes) {
            rate_limited |= matches!(provider_outcome.outcome, CandidateOutcome::RateLimited(_));
            self.record_attempt(
                &mut attempts[index],
                &provider_outcome.outcome,
                provider_outcome.circuit_open_for,
            )
            .await?;
        }

        let succeeded = attempts.iter().any(|a| a.status == AttemptStatus::Succeeded);
        let empty = attempts.iter().any(|a| a.status == AttemptStatus::Empty);
        let next_provider_retry = attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::RetryPending)
            .filter_map(|a| a.next_retry_at)
            .min();

        if succeeded || attempts.is_empty() {
            return Ok(StageOutcome::Advance);
        }

        if let Some(retry_at) = next_provider_retry {
            let kind = if rate_limited {
                StageErrorKind::RateLimited
            } else {
                StageErrorKind::Transient
            };
            return Ok(StageOutcome::Retry {
                error: StageError::new(kind, Stage::Discovering, "no provider succeeded yet"),
                retry_at,
            });
        }

        if empty {
            return Ok(StageOutcome::Advance);
        }

        Ok(StageOutcome::Fail(StageError::new(
            StageErrorKind::Permanent,
            Stage::Discovering,
            "every provider failed permanently",
        )))
    }

    async fn extract(&self, entity_id: &EntityId) -> Result<()> {
        let stored = candidates::list_candidates(self.db.pool(), entity_id).await?;
        let mut dropped = 0;
        for candidate in &stored {
            let clean = clean_record(self.merge.validator(), &candidate.record);
            dropped += clean.rejected.len();
            candidates::set_clean_fields(self.db.pool(), candidate.id, &clean.fields).await?;
        }
        debug!(entity_id = %entity_id, candidates = stored.len(), dropped, "candidates extracted");
        Ok(())
    }

    /// Merge the clean candidates and store the profile.
    ///
    /// Candidates not yet extracted are validated on the fly. Dropped-field
    /// counts cover both the extraction and the merge.
    async fn merge_profile(&self, entity_id: &EntityId, qualify: bool) -> Result<()> {
        let stored = candidates::list_candidates(self.db.pool(), entity_id).await?;

        let mut dropped = 0usize;
        let records: Vec<CandidateRecord> = stored
            .iter()
            .map(|candidate| {
                let clean = candidate.clean_record().unwrap_or_else(|| CandidateRecord {
                    fields: clean_record(self.merge.validator(), &candidate.record).fields,
                    ..candidate.record.clone()
                });
                dropped += candidate.record.fields.len().saturating_sub(clean.fields.len());
                clean
            })
            .collect();

        let mut profile = self.merge.merge(entity_id, &records)?;
        profile.dropped_fields = profile
            .dropped_fields
            .saturating_add(u32::try_from(dropped).unwrap_or(u32::MAX));
        if qualify {
            self.merge.qualify(&mut profile);
        }

        profiles::save_profile(self.db.pool(), entity_id, &profile, self.clock.now()).await?;
        debug!(entity_id = %entity_id, fields = profile.fields.len(), qualified = profile.qualified, "profile stored");
        Ok(())
    }

    async fn qualify(&self, entity_id: &EntityId) -> Result<()> {
        let profile = profiles::load_profile::<MergedProfile>(self.db.pool(), entity_id).await?;
        match profile {
            Some(mut profile) => {
                self.merge.qualify(&mut profile);
                profiles::save_profile(self.db.pool(), entity_id, &profile, self.clock.now()).await?;
            }
            None => self.merge_profile(entity_id, true).await?,
        }
        Ok(())
    }

    /// Store the result of asking one provider.
    ///
    /// A call the circuit breaker rejected never reached the provider: it is
    /// not counted and is retried once the breaker admits a probe again.
    async fn record_attempt(
        &self,
        attempt: &mut ProviderAttempt,
        outcome: &CandidateOutcome,
        circuit_open_for: Option<Duration>,
    ) -> Result<()> {
        let now = self.clock.now();
        attempt.last_outcome = Some(outcome.to_string());
        attempt.updated_at = now;

        if let Some(open_for) = circuit_open_for {
            attempt.status = AttemptStatus::RetryPending;
            attempt.next_retry_at = Some(self.policy.retry_at(
                now,
                attempt.attempt_count.saturating_sub(1),
                Some(open_for),
            ));
            debug!(
                entity_id = %attempt.entity_id,
                provider_id = %attempt.provider_id,
                retry_at = ?attempt.next_retry_at,
                "circuit open, provider deferred"
            );
            attempts::save_attempt(self.db.pool(), attempt).await?;
            return Ok(());
        }

        attempt.attempt_count += 1;
        attempt.next_retry_at = None;

        attempt.status = match outcome {
            CandidateOutcome::Success(records) => {
                candidates::replace_candidates(self.db.pool(), &attempt.entity_id, &attempt.provider_id, records)
                    .await?;
                AttemptStatus::Succeeded
            }
            CandidateOutcome::EmptyResult => {
                candidates::replace_candidates(self.db.pool(), &attempt.entity_id, &attempt.provider_id, &[])
                    .await?;
                AttemptStatus::Empty
            }
            CandidateOutcome::TransientFailure(_) | CandidateOutcome::RateLimited(_)
                if !self.policy.provider_exhausted(attempt.attempt_count) =>
            {
                attempt.next_retry_at = Some(self.policy.retry_at(
                    now,
                    attempt.attempt_count - 1,
                    outcome.retry_after(),
                ));
                AttemptStatus::RetryPending
            }
            CandidateOutcome::TransientFailure(_)
            | CandidateOutcome::RateLimited(_)
            | CandidateOutcome::PermanentFailure(_) => AttemptStatus::Failed,
        };

        attempts::save_attempt(self.db.pool(), attempt).await?;
        Ok(())
    }

    async fn load_entity(&self, entity_id: &EntityId) -> Result<Entity> {
        entities::get_entity(self.db.pool(), entity_id)
            .await?
            .ok_or_else(|| SchedulerError::EntityMissing(entity_id.clone()))
    }
}

impl std::fmt::Debug for StageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageProcessor")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use quarry_cache::ProviderCache;
    use quarry_core::{AppConfig, ManualClock};
    use quarry_provider::{ProviderDescriptor, ScriptedProvider};
    use std::time::Duration;

    struct Harness {
        db: Database,
        clock: Arc<ManualClock>,
        processor: StageProcessor,
    }

    impl Harness {
        async fn new(providers: Vec<ScriptedProvider>) -> Self {
            Self::with_config(config(), providers).await
        }

        async fn with_config(config: AppConfig, providers: Vec<ScriptedProvider>) -> Self {
            let db = Database::new(":memory:").await.expect("create database");
            db.run_migrations().await.expect("run migrations");
            let clock = Arc::new(ManualClock::new(Utc::now().trunc_subsecs(6)));
            let dyn_clock: Arc<dyn Clock> = clock.clone();

            let registry = ProviderRegistry::new();
            for provider in providers {
                registry.register(Arc::new(provider)).expect("register provider");
            }
            let cache = Arc::new(ProviderCache::new(config.cache.clone(), None, dyn_clock.clone()));
            let fetch = FetchOrchestrator::from_config(&config, cache).expect("orchestrator");
            let merge = MergeEngine::new(config.merge.clone()).expect("merge engine");
            let policy = RetryPolicy::from_config(&config.scheduler);

            Self {
                processor: StageProcessor::new(db.clone(), registry, fetch, merge, policy, dyn_clock),
                db,
                clock,
            }
        }

        async fn enqueue(&self, entity: &Entity) {
            entities::enqueue_entity(self.db.pool(), entity, self.clock.now())
                .await
                .expect("enqueue entity");
        }

        async fn step(&self, entity_id: &EntityId) -> Transition {
            let state = self.db.load(entity_id).await.expect("load").expect("state exists");
            self.processor.process(state).await.expect("process")
        }

        async fn state(&self, entity_id: &EntityId) -> ProcessingState {
            self.db.load(entity_id).await.expect("load").expect("state exists")
        }

        async fn profile(&self, entity_id: &EntityId) -> MergedProfile {
            profiles::load_profile(self.db.pool(), entity_id)
                .await
                .expect("load profile")
                .expect("profile exists")
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.rate_limits.max_jitter_ms = 0;
        config.rate_limits.default.limit = 1_000;
        config.scheduler.retry_jitter_ms = 0;
        config.scheduler.max_stage_attempts = 2;
        config.scheduler.max_provider_attempts = 3;
        config
    }

    fn id(value: &str) -> EntityId {
        EntityId::new(value).expect("valid id")
    }

    fn scripted(provider: &str, weight: f64) -> ScriptedProvider {
        ScriptedProvider::new(ProviderDescriptor::new(
            ProviderId::new(provider).expect("valid id"),
            weight,
        ))
    }

    #[tokio::test]
    async fn test_entity_walks_every_stage() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("directory", 0.9)
            .respond_with(&acme, [[("full_name", "Jane Doe"), ("title", "Director")]])])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;

        let mut stages = Vec::new();
        for _ in 0..5 {
            let transition = harness.step(&acme).await;
            assert!(!transition.retry_scheduled);
            stages.push(transition.to);
        }
        assert_eq!(
            stages,
            vec![
                Stage::Discovering,
                Stage::Extracting,
                Stage::Merging,
                Stage::Qualifying,
                Stage::Done
            ]
        );

        let profile = harness.profile(&acme).await;
        assert!(profile.qualified);
        assert_eq!(profile.value("full_name"), Some("Jane Doe"));

        let candidates = candidates::list_candidates(harness.db.pool(), &acme).await.expect("list");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].clean_fields.is_some());

        let done = harness.step(&acme).await;
        assert_eq!((done.from, done.to), (Stage::Done, Stage::Done));
    }

    #[tokio::test]
    async fn test_blank_entity_fails_validation() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("directory", 0.9)]).await;
        harness.enqueue(&Entity::new(acme.clone(), "   ")).await;

        let transition = harness.step(&acme).await;
        assert_eq!(transition.to, Stage::Failed);

        let state = harness.state(&acme).await;
        let error = state.last_error.expect("error recorded");
        assert_eq!(error.kind, StageErrorKind::Validation);
        assert_eq!(error.stage, Stage::Pending);
    }

    #[tokio::test]
    async fn test_partial_failure_advances_and_retries_provider_later() {
        let acme = id("acme");
        let harness = Harness::new(vec![
            scripted("directory", 0.9).respond_with(&acme, [[("full_name", "Jane Doe")]]),
            scripted("registry", 0.6)
                .script(&acme, [CandidateOutcome::TransientFailure("503".into())])
                .respond_with(&acme, [[("full_name", "Jane Doe"), ("title", "Director")]]),
        ])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;

        harness.step(&acme).await;
        let discovered = harness.step(&acme).await;
        assert_eq!(discovered.to, Stage::Extracting);

        let attempts = attempts::list_attempts(harness.db.pool(), &acme).await.expect("attempts");
        let registry = attempts
            .iter()
            .find(|a| a.provider_id.as_str() == "registry")
            .expect("registry attempt")
            .clone();
        assert_eq!(registry.status, AttemptStatus::RetryPending);
        assert_eq!(
            registry.next_retry_at,
            Some(harness.clock.now() + chrono::Duration::seconds(30))
        );

        for _ in 0..3 {
            harness.step(&acme).await;
        }
        assert_eq!(harness.state(&acme).await.stage, Stage::Done);
        assert_eq!(harness.profile(&acme).await.value("title"), None);

        harness.clock.advance(Duration::from_secs(31));
        let retry = harness.processor.retry_provider(registry).await.expect("retry");
        assert_eq!(retry.status, AttemptStatus::Succeeded);
        assert!(retry.profile_recomputed);

        let profile = harness.profile(&acme).await;
        assert_eq!(profile.value("title"), Some("Director"));
        assert!(profile.qualified);
        assert_eq!(harness.state(&acme).await.stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_provider_without_spending_attempts() {
        let acme = id("acme");
        let mut config = config();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.cooldown_secs = 1;
        let harness = Harness::with_config(
            config,
            vec![
                scripted("directory", 0.9).respond_with(&acme, [[("full_name", "Jane Doe")]]),
                scripted("registry", 0.6)
                    .script(&acme, [CandidateOutcome::TransientFailure("503".into())])
                    .respond_with(&acme, [[("title", "Director")]]),
            ],
        )
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;
        harness.step(&acme).await;
        harness.step(&acme).await;

        let registry = |attempts: Vec<ProviderAttempt>| {
            attempts
                .into_iter()
                .find(|a| a.provider_id.as_str() == "registry")
                .expect("registry attempt")
        };
        let attempt = registry(attempts::list_attempts(harness.db.pool(), &acme).await.expect("attempts"));
        assert_eq!((attempt.status, attempt.attempt_count), (AttemptStatus::RetryPending, 1));

        // The breaker opened on the 503 and is still cooling down.
        harness.clock.advance(Duration::from_secs(31));
        let deferred = harness.processor.retry_provider(attempt).await.expect("retry");
        assert_eq!(deferred.status, AttemptStatus::RetryPending);
        let attempt = registry(attempts::list_attempts(harness.db.pool(), &acme).await.expect("attempts"));
        assert_eq!(attempt.attempt_count, 1);
        assert!(attempt.next_retry_at.is_some_and(|at| at > harness.clock.now()));
        assert!(attempt.last_outcome.as_deref().is_some_and(|o| o.contains("circuit-open")));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        harness.clock.advance(Duration::from_secs(31));
        let retried = harness.processor.retry_provider(attempt).await.expect("retry");
        assert_eq!(retried.status, AttemptStatus::Succeeded);
        let attempt = registry(attempts::list_attempts(harness.db.pool(), &acme).await.expect("attempts"));
        assert_eq!(attempt.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_all_transient_retries_then_fails() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("directory", 0.9)
            .with_default(CandidateOutcome::TransientFailure("timeout".into()))])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;
        harness.step(&acme).await;

        let first = harness.step(&acme).await;
        assert!(first.retry_scheduled);
        assert_eq!(first.to, Stage::Discovering);
        let state = harness.state(&acme).await;
        assert_eq!(state.attempt_count, 1);
        assert!(state.next_retry_at.is_some_and(|at| at > harness.clock.now()));

        harness.clock.advance(Duration::from_secs(3600));
        let second = harness.step(&acme).await;
        assert_eq!(second.to, Stage::Failed);

        let state = harness.state(&acme).await;
        assert_eq!(state.last_error.map(|e| e.kind), Some(StageErrorKind::Transient));
        let attempts = attempts::list_attempts(harness.db.pool(), &acme).await.expect("attempts");
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
    }

    #[tokio::test]
    async fn test_rate_limited_stage_retry_is_labelled() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("search", 0.5)
            .with_default(CandidateOutcome::RateLimited(None))])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;
        harness.step(&acme).await;

        assert!(harness.step(&acme).await.retry_scheduled);
        let state = harness.state(&acme).await;
        assert_eq!(state.last_error.map(|e| e.kind), Some(StageErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn test_every_provider_permanent_fails_entity() {
        let acme = id("acme");
        let harness = Harness::new(vec![
            scripted("directory", 0.9).with_default(CandidateOutcome::PermanentFailure("401".into())),
            scripted("registry", 0.6).with_default(CandidateOutcome::PermanentFailure("404".into())),
        ])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;
        harness.step(&acme).await;

        let transition = harness.step(&acme).await;
        assert_eq!(transition.to, Stage::Failed);
        let state = harness.state(&acme).await;
        assert_eq!(state.last_error.map(|e| e.kind), Some(StageErrorKind::Permanent));
    }

    #[tokio::test]
    async fn test_empty_results_complete_unqualified() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("directory", 0.9)]).await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;

        for _ in 0..5 {
            harness.step(&acme).await;
        }
        assert_eq!(harness.state(&acme).await.stage, Stage::Done);
        let profile = harness.profile(&acme).await;
        assert!(profile.fields.is_empty());
        assert!(!profile.qualified);
    }

    #[tokio::test]
    async fn test_malformed_fields_are_counted_once() {
        let acme = id("acme");
        let harness = Harness::new(vec![scripted("directory", 0.9).respond_with(
            &acme,
            [[("full_name", "Jane Doe"), ("email", "not-an-email"), ("phone", "12")]],
        )])
        .await;
        harness.enqueue(&Entity::new(acme.clone(), "Acme")).await;

        for _ in 0..5 {
            harness.step(&acme).await;
        }
        let profile = harness.profile(&acme).await;
        assert_eq!(profile.dropped_fields, 2);
        assert_eq!(profile.fields.len(), 1);
    }
}
