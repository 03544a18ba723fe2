//! Full scheduler runs against an in-memory database and a manual clock.

use chrono::{SubsecRound, Utc};
use quarry_cache::ProviderCache;
use quarry_core::{AppConfig, Clock, Entity, EntityId, ManualClock, ProviderId, Stage, SystemClock};
use quarry_db::{attempts, batch_runs, entities, profiles, AttemptStatus, BatchStatus, Database, StateStore};
use quarry_fetch::FetchOrchestrator;
use quarry_merge::{MergeEngine, MergedProfile};
use quarry_provider::{CandidateOutcome, Provider, ProviderDescriptor, ProviderRegistry, ScriptedProvider};
use quarry_scheduler::{CancellationToken, RetryPolicy, Scheduler, StageProcessor};
use std::sync::Arc;
use std::time::Duration;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limits.max_jitter_ms = 0;
    config.rate_limits.default.limit = 1_000;
    config.scheduler.retry_jitter_ms = 0;
    config.scheduler.max_provider_attempts = 3;
    config.scheduler.workers = 3;
    config
}

async fn database() -> Database {
    let db = Database::new(":memory:").await.expect("create database");
    db.run_migrations().await.expect("run migrations");
    db
}

fn scheduler(db: &Database, clock: &Arc<ManualClock>, providers: Vec<Arc<ScriptedProvider>>) -> Scheduler {
    let registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider).expect("register provider");
    }
    build_scheduler(db, clock.clone(), config(), registry)
}

fn build_scheduler(db: &Database, clock: Arc<dyn Clock>, config: AppConfig, registry: ProviderRegistry) -> Scheduler {
    let cache = Arc::new(ProviderCache::new(config.cache.clone(), Some(db.clone()), clock.clone()));
    let fetch = FetchOrchestrator::from_config(&config, cache).expect("orchestrator");
    let merge = MergeEngine::new(config.merge.clone()).expect("merge engine");
    let processor = StageProcessor::new(
        db.clone(),
        registry,
        fetch,
        merge,
        RetryPolicy::from_config(&config.scheduler),
        clock.clone(),
    );
    Scheduler::new(db.clone(), processor, config.scheduler, clock)
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

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now().trunc_subsecs(6)))
}

async fn enqueue(db: &Database, clock: &ManualClock, ids: &[&str]) {
    for entity_id in ids {
        entities::enqueue_entity(db.pool(), &Entity::new(id(entity_id), "Acme"), clock.now())
            .await
            .expect("enqueue entity");
    }
}

async fn profile(db: &Database, entity_id: &EntityId) -> MergedProfile {
    profiles::load_profile(db.pool(), entity_id)
        .await
        .expect("load profile")
        .expect("profile exists")
}

#[tokio::test]
async fn test_corroborated_name_with_rate_limited_third_provider() {
    let db = database().await;
    let clock = clock();
    let acme = id("acme");

    let a = Arc::new(scripted("a", 0.9).respond_with(&acme, [[("full_name", "Jane Doe"), ("title", "Director")]]));
    let b = Arc::new(scripted("b", 0.5).respond_with(&acme, [[("full_name", "J. Doe"), ("title", "Director")]]));
    let c = Arc::new(
        scripted("c", 0.7)
            .script(&acme, [CandidateOutcome::RateLimited(None)])
            .script(&acme, [CandidateOutcome::EmptyResult]),
    );
    enqueue(&db, &clock, &["acme"]).await;

    let run = scheduler(&db, &clock, vec![a, b, c.clone()])
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!(run.entities_done, 1);
    assert_eq!(run.provider_retries, 1);
    assert_eq!(c.calls_for(&acme), 2);

    let profile = profile(&db, &acme).await;
    let name = &profile.fields["full_name"];
    assert_eq!(name.value, "Jane Doe");
    assert_eq!(
        name.supporting_providers.iter().map(ProviderId::as_str).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(profile.fields["title"].supporting_providers.len(), 2);

    let attempts = attempts::list_attempts(db.pool(), &acme).await.expect("attempts");
    let c_attempt = attempts.iter().find(|a| a.provider_id.as_str() == "c").expect("c attempt");
    assert_eq!(c_attempt.status, AttemptStatus::Empty);
}

#[tokio::test]
async fn test_two_transient_of_five_complete_and_retry_to_cap() {
    let db = database().await;
    let clock = clock();
    let acme = id("acme");

    let mut providers = Vec::new();
    for (name, weight) in [("p1", 0.9), ("p2", 0.8), ("p3", 0.7)] {
        providers.push(Arc::new(scripted(name, weight).respond_with(&acme, [[("full_name", "Jane Doe")]])));
    }
    let flaky = Arc::new(scripted("p4", 0.6).with_default(CandidateOutcome::TransientFailure("503".into())));
    let recovering = Arc::new(
        scripted("p5", 0.6)
            .script(&acme, [CandidateOutcome::TransientFailure("timeout".into())])
            .respond_with(&acme, [[("email", "jane@acme.io")]]),
    );
    providers.push(flaky.clone());
    providers.push(recovering.clone());
    enqueue(&db, &clock, &["acme"]).await;

    let run = scheduler(&db, &clock, providers)
        .run(CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(run.status, BatchStatus::Completed);

    let state = db.load(&acme).await.expect("load").expect("state");
    assert_eq!(state.stage, Stage::Done);

    let attempts = attempts::list_attempts(db.pool(), &acme).await.expect("attempts");
    let status = |provider: &str| {
        attempts
            .iter()
            .find(|a| a.provider_id.as_str() == provider)
            .map(|a| (a.status, a.attempt_count))
            .expect("attempt exists")
    };
    assert_eq!(status("p4"), (AttemptStatus::Failed, 3));
    assert_eq!(status("p5"), (AttemptStatus::Succeeded, 2));
    assert_eq!(flaky.calls_for(&acme), 3);

    let profile = profile(&db, &acme).await;
    assert_eq!(profile.value("email"), Some("jane@acme.io"));
    assert!(profile.qualified);
}

#[tokio::test]
async fn test_restart_mid_batch_matches_uninterrupted_run() {
    let ids = ["e1", "e2", "e3", "e4"];
    let providers = || {
        let mut a = scripted("a", 0.9);
        let mut b = scripted("b", 0.5);
        for entity_id in ids {
            let entity_id = id(entity_id);
            a = a.respond_with(&entity_id, [[("full_name", "Jane Doe"), ("title", "Director")]]);
            b = b
                .script(&entity_id, [CandidateOutcome::TransientFailure("503".into())])
                .respond_with(&entity_id, [[("full_name", "J. Doe"), ("phone", "+49 30 1234567")]]);
        }
        vec![Arc::new(a), Arc::new(b)]
    };

    let uninterrupted = database().await;
    let clock_a = clock();
    enqueue(&uninterrupted, &clock_a, &ids).await;
    scheduler(&uninterrupted, &clock_a, providers())
        .run(CancellationToken::new())
        .await
        .expect("run");

    let interrupted = database().await;
    let clock_b = clock();
    enqueue(&interrupted, &clock_b, &ids).await;
    let first = scheduler(&interrupted, &clock_b, providers());
    let shutdown = CancellationToken::new();
    first.run_round(&shutdown).await.expect("round");
    first.run_round(&shutdown).await.expect("round");
    drop(first);

    let resumed = scheduler(&interrupted, &clock_b, providers())
        .run(CancellationToken::new())
        .await
        .expect("resume");
    assert_eq!(resumed.status, BatchStatus::Completed);

    for entity_id in ids {
        let entity_id = id(entity_id);
        let expected = profiles::load_profile_json(uninterrupted.pool(), &entity_id)
            .await
            .expect("load")
            .expect("profile");
        let actual = profiles::load_profile_json(interrupted.pool(), &entity_id)
            .await
            .expect("load")
            .expect("profile");
        assert_eq!(actual, expected, "profile of {entity_id}");
    }
}

#[tokio::test]
async fn test_cancelled_run_claims_nothing() {
    let db = database().await;
    let clock = clock();
    enqueue(&db, &clock, &["acme"]).await;

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let run = scheduler(&db, &clock, vec![Arc::new(scripted("a", 0.9))])
        .run(shutdown)
        .await
        .expect("run");

    assert_eq!(run.status, BatchStatus::Cancelled);
    assert_eq!(run.transitions, 0);
    let stored = batch_runs::get_batch_run(db.pool(), &run.id)
        .await
        .expect("load run")
        .expect("run exists");
    assert_eq!(stored.status, BatchStatus::Cancelled);
    assert!(stored.finished_at.is_some());
    assert_eq!(
        db.load(&id("acme")).await.expect("load").expect("state").stage,
        Stage::Pending
    );
}

#[tokio::test]
async fn test_leased_entity_is_skipped_until_lease_expires() {
    let db = database().await;
    let clock = clock();
    enqueue(&db, &clock, &["acme"]).await;
    let acme = id("acme");

    assert!(db
        .claim(&acme, "other-worker", clock.now(), Duration::from_secs(60))
        .await
        .expect("claim"));

    let scheduler = scheduler(&db, &clock, vec![Arc::new(scripted("a", 0.9))]);
    let round = scheduler.run_round(&CancellationToken::new()).await.expect("round");
    assert!(round.is_idle());
    assert_eq!(db.load(&acme).await.expect("load").expect("state").stage, Stage::Pending);

    clock.advance(Duration::from_secs(61));
    let round = scheduler.run_round(&CancellationToken::new()).await.expect("round");
    assert_eq!(round.transitions, 1);
    assert_eq!(db.load(&acme).await.expect("load").expect("state").stage, Stage::Discovering);
}

#[tokio::test]
async fn test_failed_entities_are_counted_not_dropped() {
    let db = database().await;
    let clock = clock();
    let good = id("good");
    enqueue(&db, &clock, &["good", "bad"]).await;

    let provider = scripted("a", 0.9)
        .with_default(CandidateOutcome::PermanentFailure("404".into()))
        .respond_with(&good, [[("full_name", "Jane Doe")]]);
    let run = scheduler(&db, &clock, vec![Arc::new(provider)])
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!((run.entities_done, run.entities_failed), (1, 1));
    let bad = db.load(&id("bad")).await.expect("load").expect("state");
    assert_eq!(bad.stage, Stage::Failed);
    assert!(bad.last_error.is_some());
}

struct CrashingProvider {
    descriptor: ProviderDescriptor,
    crashes_on: EntityId,
}

#[async_trait::async_trait]
impl Provider for CrashingProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn lookup(&self, entity: &Entity) -> CandidateOutcome {
        if entity.entity_id == self.crashes_on {
            panic!("plugin crashed on {}", entity.entity_id);
        }
        CandidateOutcome::EmptyResult
    }
}

#[tokio::test]
async fn test_panicking_provider_does_not_stop_the_batch() {
    let db = database().await;
    let clock = clock();
    let boom = id("boom");
    enqueue(&db, &clock, &["good", "boom"]).await;

    let registry = ProviderRegistry::new();
    let mut directory = scripted("a", 0.9);
    for entity_id in ["good", "boom"] {
        directory = directory.respond_with(&id(entity_id), [[("full_name", "Jane Doe")]]);
    }
    registry.register(Arc::new(directory)).expect("register provider");
    registry
        .register(Arc::new(CrashingProvider {
            descriptor: ProviderDescriptor::new(ProviderId::new("plugin").expect("valid id"), 0.5),
            crashes_on: boom.clone(),
        }))
        .expect("register provider");

    let run = build_scheduler(&db, clock.clone(), config(), registry)
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!((run.entities_done, run.entities_failed), (2, 0));
    let stored = batch_runs::get_batch_run(db.pool(), &run.id)
        .await
        .expect("load run")
        .expect("run exists");
    assert_eq!(stored.status, BatchStatus::Completed);

    let attempts = attempts::list_attempts(db.pool(), &boom).await.expect("attempts");
    let plugin = attempts
        .iter()
        .find(|a| a.provider_id.as_str() == "plugin")
        .expect("plugin attempt");
    assert_eq!((plugin.status, plugin.attempt_count), (AttemptStatus::Failed, 3));
    assert!(plugin.last_outcome.as_deref().is_some_and(|o| o.contains("panicked")));
    assert_eq!(profile(&db, &boom).await.value("full_name"), Some("Jane Doe"));
}

#[tokio::test]
async fn test_lease_is_renewed_while_a_stage_runs_long() {
    let db = database().await;
    let acme = id("acme");
    entities::enqueue_entity(db.pool(), &Entity::new(acme.clone(), "Acme"), Utc::now())
        .await
        .expect("enqueue entity");

    let mut config = config();
    config.scheduler.lease_secs = 1;
    let registry = ProviderRegistry::new();
    registry
        .register(Arc::new(
            scripted("slow", 0.9)
                .with_delay(Duration::from_millis(2_500))
                .respond_with(&acme, [[("full_name", "Jane Doe")]]),
        ))
        .expect("register provider");
    let scheduler = build_scheduler(&db, Arc::new(SystemClock), config, registry);
    let shutdown = CancellationToken::new();

    scheduler.run_round(&shutdown).await.expect("plan round");
    let (round, contender) = tokio::join!(scheduler.run_round(&shutdown), async {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        db.claim(&acme, "other-worker", Utc::now(), Duration::from_secs(60)).await
    });

    assert!(!contender.expect("claim"), "lease expired while discovery was running");
    assert_eq!(round.expect("discovery round").transitions, 1);
    assert_eq!(db.load(&acme).await.expect("load").expect("state").stage, Stage::Extracting);
    assert!(db
        .claim(&acme, "other-worker", Utc::now(), Duration::from_secs(60))
        .await
        .expect("claim after release"));
}
