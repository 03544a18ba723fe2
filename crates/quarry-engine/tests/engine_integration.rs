//! End-to-end batches through the assembled engine.

use chrono::{SubsecRound, Utc};
use quarry_core::{AppConfig, Clock, Entity, EntityId, ManualClock, ProviderConfig, ProviderId, Stage, SystemClock};
use quarry_db::{BatchStatus, Database};
use quarry_engine::{CancellationToken, Engine, EngineError};
use quarry_provider::{CandidateOutcome, ProviderDescriptor, ProviderRegistry, ScriptedProvider};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limits.max_jitter_ms = 0;
    config.rate_limits.default.limit = 1_000;
    config.scheduler.retry_jitter_ms = 0;
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

fn registry(providers: Vec<ScriptedProvider>) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(Arc::new(provider)).expect("register provider");
    }
    registry
}

async fn memory_database() -> Database {
    let db = Database::new(":memory:").await.expect("create database");
    db.run_migrations().await.expect("run migrations");
    db
}

fn manual_clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Utc::now().trunc_subsecs(6)))
}

#[tokio::test]
async fn test_batch_reports_every_entity() {
    let acme = id("acme");
    let globex = id("globex");
    let providers = vec![
        scripted("a", 0.9)
            .respond_with(&acme, [[("full_name", "Jane Doe"), ("title", "Director")]])
            .respond_with(&globex, [[("full_name", "John Roe")]]),
        scripted("b", 0.5).respond_with(&acme, [[("full_name", "J. Doe"), ("title", "Director")]]),
        scripted("c", 0.7)
            .with_default(CandidateOutcome::PermanentFailure("403".into()))
            .script(&acme, [CandidateOutcome::RateLimited(None), CandidateOutcome::EmptyResult]),
    ];
    let engine = Engine::with_parts(config(), memory_database().await, registry(providers), manual_clock())
        .expect("engine");

    let summary = engine
        .enqueue(&[
            Entity::new(acme.clone(), "Acme"),
            Entity::new(globex.clone(), "Globex"),
            Entity::new(id("blank"), " "),
        ])
        .await
        .expect("enqueue");
    assert_eq!(summary.added, 3);

    let run = engine.run(CancellationToken::new()).await.expect("run");
    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!((run.entities_done, run.entities_failed), (2, 1));

    let reports = engine.reports().await.expect("reports");
    assert_eq!(reports.len(), 3);

    let acme_report = engine.report(&acme).await.expect("report").expect("known entity");
    assert!(acme_report.is_qualified());
    let profile = acme_report.profile.expect("profile published");
    assert_eq!(profile.value("full_name"), Some("Jane Doe"));
    assert_eq!(profile.fields["full_name"].supporting_providers.len(), 2);

    let blank = engine.report(&id("blank")).await.expect("report").expect("known entity");
    assert_eq!(blank.stage, Stage::Failed);
    assert!(blank.profile.is_none());
    assert!(blank.last_error.is_some());

    assert!(engine.report(&id("missing")).await.expect("report").is_none());
    assert_eq!(
        engine.stage_counts().await.expect("counts"),
        vec![(Stage::Done, 2), (Stage::Failed, 1)]
    );
}

#[tokio::test]
async fn test_enqueue_twice_keeps_progress() {
    let acme = id("acme");
    let engine = Engine::with_parts(
        config(),
        memory_database().await,
        registry(vec![scripted("a", 0.9).respond_with(&acme, [[("full_name", "Jane Doe")]])]),
        manual_clock(),
    )
    .expect("engine");

    let batch = [Entity::new(acme.clone(), "Acme")];
    engine.enqueue(&batch).await.expect("enqueue");
    engine.run(CancellationToken::new()).await.expect("run");

    let summary = engine.enqueue(&batch).await.expect("enqueue again");
    assert_eq!((summary.added, summary.existing), (0, 1));
    let report = engine.report(&acme).await.expect("report").expect("known entity");
    assert_eq!(report.stage, Stage::Done);
}

#[tokio::test]
async fn test_batch_resumes_from_disk_after_restart() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("quarry.db");
    let entity_ids = ["e1", "e2", "e3"];
    let providers = || {
        let mut a = scripted("a", 0.9);
        for entity_id in entity_ids {
            a = a.respond_with(&id(entity_id), [[("full_name", "Jane Doe"), ("email", "jane@acme.io")]]);
        }
        registry(vec![a])
    };

    {
        let db = Database::new(&path).await.expect("open database");
        db.run_migrations().await.expect("run migrations");
        let engine = Engine::with_parts(config(), db, providers(), manual_clock()).expect("engine");
        let batch: Vec<Entity> = entity_ids.iter().map(|e| Entity::new(id(e), "Acme")).collect();
        engine.enqueue(&batch).await.expect("enqueue");

        let scheduler = engine.scheduler();
        let shutdown = CancellationToken::new();
        for _ in 0..2 {
            scheduler.run_round(&shutdown).await.expect("round");
        }
        assert_eq!(
            engine.stage_counts().await.expect("counts"),
            vec![(Stage::Extracting, 3)]
        );
        engine.close().await;
    }

    let db = Database::new(&path).await.expect("reopen database");
    db.run_migrations().await.expect("run migrations");
    let engine = Engine::with_parts(config(), db, providers(), manual_clock()).expect("engine");
    let run = engine.run(CancellationToken::new()).await.expect("resume");
    assert_eq!(run.status, BatchStatus::Completed);
    assert_eq!(run.entities_done, 3);

    for report in engine.reports().await.expect("reports") {
        assert!(report.is_qualified(), "{} not qualified", report.entity_id);
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_wait() {
    let mut config = config();
    config.scheduler.retry_base_secs = 3_600;
    let engine = Engine::with_parts(
        config,
        memory_database().await,
        registry(vec![scripted("a", 0.9).with_default(CandidateOutcome::TransientFailure("503".into()))]),
        Arc::new(SystemClock),
    )
    .expect("engine");
    engine.enqueue(&[Entity::new(id("acme"), "Acme")]).await.expect("enqueue");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let run = tokio::time::timeout(Duration::from_secs(10), engine.run(shutdown))
        .await
        .expect("run stops after cancellation")
        .expect("run");
    assert_eq!(run.status, BatchStatus::Cancelled);

    let report = engine.report(&id("acme")).await.expect("report").expect("known entity");
    assert_eq!(report.stage, Stage::Discovering);
    assert!(report.last_error.is_some());
}

#[tokio::test]
async fn test_open_from_config_file_paths() {
    let dir = TempDir::new().expect("create temp dir");
    let mut config = config();
    config.general.data_dir = Some(dir.path().to_path_buf());
    config.providers.push(ProviderConfig {
        id: "directory".to_string(),
        endpoint: "https://directory.example/api/contacts".to_string(),
        weight: 0.6,
        locales: vec!["de".to_string()],
        sectors: Vec::new(),
        api_key_env: None,
    });

    let engine = Engine::open(config).await.expect("open engine");
    assert!(dir.path().join("quarry.db").exists());
    assert!(engine.registry().contains(&ProviderId::new("directory").expect("valid id")));
    engine.close().await;

    let mut invalid = AppConfig::default();
    invalid.scheduler.workers = 0;
    assert!(matches!(Engine::open(invalid).await, Err(EngineError::Config(_))));
}
