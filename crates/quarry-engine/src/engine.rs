//! Engine wiring: one database, one registry and one set of shared fetch
//! services per process.

use crate::error::Result;
use crate::report::EntityReport;
use quarry_cache::{CacheStats, ProviderCache};
use quarry_core::{AppConfig, Clock, Entity, EntityId, Stage, SystemClock};
use quarry_db::{entities, profiles, state, BatchRun, Database, StateStore};
use quarry_fetch::FetchOrchestrator;
use quarry_merge::{MergeEngine, MergedProfile};
use quarry_provider::{HttpJsonProvider, ProviderRegistry};
use quarry_scheduler::{CancellationToken, RetryPolicy, Scheduler, StageProcessor};
use std::sync::Arc;
use tracing::{info, warn};

/// Counts from an enqueue call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueSummary {
    /// Entities inserted as `PENDING`
    pub added: usize,
    /// Entities that were already known and left untouched
    pub existing: usize,
}

/// The assembled enrichment pipeline.
pub struct Engine {
    config: AppConfig,
    db: Database,
    registry: ProviderRegistry,
    fetch: FetchOrchestrator,
    merge: MergeEngine,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Open the configured database and register every configured provider.
    pub async fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let path = config.database_path()?;
        let db = Database::open(&path, &config.database).await?;
        db.run_migrations().await?;
        info!(path = %path.display(), "state database ready");

        let registry = ProviderRegistry::new();
        for provider in &config.providers {
            let provider = HttpJsonProvider::from_config(provider, config.fetch.call_timeout())?;
            registry.register(Arc::new(provider))?;
        }

        Self::with_parts(config, db, registry, Arc::new(SystemClock))
    }

    /// Assemble an engine around an existing database, registry and clock.
    ///
    /// The database must already be migrated.
    pub fn with_parts(
        config: AppConfig,
        db: Database,
        registry: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let persistent = config.cache.enabled.then(|| db.clone());
        let cache = Arc::new(ProviderCache::new(config.cache.clone(), persistent, Arc::clone(&clock)));
        let fetch = FetchOrchestrator::from_config(&config, cache)?;
        let merge = MergeEngine::new(config.merge.clone())?;

        info!(
            providers = registry.count(),
            workers = config.scheduler.workers,
            max_concurrent_calls = config.fetch.max_concurrent_calls,
            "engine assembled"
        );
        Ok(Self {
            config,
            db,
            registry,
            fetch,
            merge,
            clock,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// State database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Registered providers.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Cache hit and miss counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.fetch.cache().stats()
    }

    /// Add entities to the batch.
    ///
    /// Entities that are already known keep their progress.
    pub async fn enqueue(&self, batch: &[Entity]) -> Result<EnqueueSummary> {
        let now = self.clock.now();
        let mut summary = EnqueueSummary::default();
        for entity in batch {
            if entities::enqueue_entity(self.db.pool(), entity, now).await? {
                summary.added += 1;
            } else {
                summary.existing += 1;
            }
        }
        info!(added = summary.added, existing = summary.existing, "entities enqueued");
        Ok(summary)
    }

    /// Build a scheduler over this engine's shared services.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        let processor = StageProcessor::new(
            self.db.clone(),
            self.registry.clone(),
            self.fetch.clone(),
            self.merge.clone(),
            RetryPolicy::from_config(&self.config.scheduler),
            Arc::clone(&self.clock),
        );
        Scheduler::new(
            self.db.clone(),
            processor,
            self.config.scheduler.clone(),
            Arc::clone(&self.clock),
        )
    }

    /// Run the batch until it completes or `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<BatchRun> {
        match self.fetch.purge_cache().await {
            Ok(purged) if purged > 0 => info!(purged, "expired cache entries removed"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache purge failed"),
        }
        Ok(self.scheduler().run(shutdown).await?)
    }

    /// Report for one entity.
    pub async fn report(&self, entity_id: &EntityId) -> Result<Option<EntityReport>> {
        let Some(state) = self.db.load(entity_id).await? else {
            return Ok(None);
        };
        let profile = if state.stage.publishes_profile() {
            profiles::load_profile::<MergedProfile>(self.db.pool(), entity_id).await?
        } else {
            None
        };
        Ok(Some(EntityReport::new(state, profile)))
    }

    /// Reports for every entity, in id order.
    pub async fn reports(&self) -> Result<Vec<EntityReport>> {
        let states = state::list_states(self.db.pool()).await?;
        let mut reports = Vec::with_capacity(states.len());
        for state in states {
            let profile = if state.stage.publishes_profile() {
                profiles::load_profile::<MergedProfile>(self.db.pool(), &state.entity_id).await?
            } else {
                None
            };
            reports.push(EntityReport::new(state, profile));
        }
        Ok(reports)
    }

    /// Entity count per stage.
    pub async fn stage_counts(&self) -> Result<Vec<(Stage, u64)>> {
        Ok(state::count_by_stage(self.db.pool()).await?)
    }

    /// Close the database pool.
    pub async fn close(&self) {
        self.db.close().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("merge", &self.merge)
            .finish_non_exhaustive()
    }
}
