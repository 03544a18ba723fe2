//! Scheduler main loop.
//!
//! Each round selects due entities and due provider retries, claims every
//! entity under a lease, runs one unit of work per entity on a bounded
//! worker pool and releases the lease. The loop finishes once no
//! non-terminal entity and no provider retry is left, or when the shutdown
//! token is cancelled.
//!
//! A lease is renewed in the background for as long as its work runs, so a
//! stage that waits on a throttled provider keeps the entity to itself.

use crate::error::{Result, SchedulerError};
use crate::processor::{ProviderRetry, StageProcessor, Transition};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use quarry_core::{Clock, EntityId, ProcessingState, SchedulerConfig, Stage};
use quarry_db::{attempts, batch_runs, state, BatchRun, BatchStatus, Database, ProviderAttempt, StateStore};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(100);

/// Counters for one scheduling round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    /// Stage transitions processed
    pub transitions: u64,
    /// Provider retries processed
    pub provider_retries: u64,
    /// Entities that reached `DONE`
    pub entities_done: u64,
    /// Entities that reached `FAILED`
    pub entities_failed: u64,
    /// Entities skipped because another owner held the lease or had
    /// already moved them on
    pub contended: u64,
}

impl RoundSummary {
    /// Whether the round did any work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.transitions == 0 && self.provider_retries == 0
    }

    fn apply_to(self, run: &mut BatchRun) {
        run.transitions += self.transitions;
        run.provider_retries += self.provider_retries;
        run.entities_done += self.entities_done;
        run.entities_failed += self.entities_failed;
    }
}

enum Work {
    Stage(ProcessingState),
    Retries(EntityId, Vec<ProviderAttempt>),
}

impl Work {
    fn entity_id(&self) -> &EntityId {
        match self {
            Self::Stage(state) => &state.entity_id,
            Self::Retries(entity_id, _) => entity_id,
        }
    }
}

enum WorkResult {
    Contended,
    Stage(Transition),
    Retries(Vec<ProviderRetry>),
}

/// Drives every entity of a batch to a terminal stage.
pub struct Scheduler {
    db: Database,
    processor: Arc<StageProcessor>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    owner: String,
}

impl Scheduler {
    /// Create a scheduler with a fresh lease owner id.
    #[must_use]
    pub fn new(db: Database, processor: StageProcessor, config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            processor: Arc::new(processor),
            config,
            clock,
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Lease owner id used for claims.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run until the batch completes or `shutdown` is cancelled.
    ///
    /// In-flight work always runs to completion; cancellation only stops new
    /// claims. The returned run is persisted with its final status.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<BatchRun> {
        let mut run = batch_runs::start_batch_run(self.db.pool(), self.clock.now()).await?;
        info!(run_id = %run.id, owner = %self.owner, workers = self.config.workers, "scheduler started");

        let status = loop {
            if shutdown.is_cancelled() {
                break BatchStatus::Cancelled;
            }

            let round = self.run_round(&shutdown).await?;
            round.apply_to(&mut run);
            if !round.is_idle() {
                batch_runs::update_batch_run(self.db.pool(), &run).await?;
                continue;
            }

            let active = state::count_active(self.db.pool()).await?;
            let retries = attempts::count_pending_retries(self.db.pool()).await?;
            if active == 0 && retries == 0 {
                break BatchStatus::Completed;
            }

            let wait = self.idle_wait().await?;
            debug!(active, retries, wait = ?wait, "scheduler idle");
            tokio::select! {
                () = shutdown.cancelled() => break BatchStatus::Cancelled,
                () = self.clock.sleep(wait) => {}
            }
        };

        run.status = status;
        run.finished_at = Some(self.clock.now());
        batch_runs::update_batch_run(self.db.pool(), &run).await?;

        info!(
            run_id = %run.id,
            status = %run.status,
            transitions = run.transitions,
            provider_retries = run.provider_retries,
            done = run.entities_done,
            failed = run.entities_failed,
            "scheduler finished"
        );
        Ok(run)
    }

    /// Process everything due right now, once.
    ///
    /// Entity-level errors are logged and the entity is picked up again in a
    /// later round; only the round's own queries fail the call.
    pub async fn run_round(&self, shutdown: &CancellationToken) -> Result<RoundSummary> {
        let now = self.clock.now();
        let work = self.collect_work(now).await?;
        let mut summary = RoundSummary::default();
        if work.is_empty() {
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let lease = Duration::from_secs(self.config.lease_secs);
        let mut tasks = JoinSet::new();

        for item in work {
            if shutdown.is_cancelled() {
                debug!("shutdown requested, no further claims");
                break;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let db = self.db.clone();
            let processor = Arc::clone(&self.processor);
            let clock = Arc::clone(&self.clock);
            let owner = self.owner.clone();

            tasks.spawn(async move {
                let result = process_item(db, processor, clock, owner, lease, item).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "entity worker task ended abnormally");
                    continue;
                }
            };
            match result {
                Ok(WorkResult::Contended) => summary.contended += 1,
                Ok(WorkResult::Stage(transition)) => {
                    summary.transitions += 1;
                    match transition.to {
                        Stage::Done if transition.from != Stage::Done => summary.entities_done += 1,
                        Stage::Failed if transition.from != Stage::Failed => summary.entities_failed += 1,
                        _ => {}
                    }
                }
                Ok(WorkResult::Retries(retries)) => {
                    summary.provider_retries += u64::try_from(retries.len()).unwrap_or(u64::MAX);
                }
                Err(e) => warn!(error = %e, "entity work failed"),
            }
        }

        debug!(
            transitions = summary.transitions,
            provider_retries = summary.provider_retries,
            contended = summary.contended,
            "round finished"
        );
        Ok(summary)
    }

    async fn collect_work(&self, now: DateTime<Utc>) -> Result<Vec<Work>> {
        let limit = self.config.claim_batch_size.max(1);
        let due = self.db.due(now, limit).await?;
        let staged: HashSet<EntityId> = due.iter().map(|state| state.entity_id.clone()).collect();

        let mut retries: BTreeMap<EntityId, Vec<ProviderAttempt>> = BTreeMap::new();
        for attempt in attempts::due_retries(self.db.pool(), now, limit).await? {
            if !staged.contains(&attempt.entity_id) {
                retries.entry(attempt.entity_id.clone()).or_default().push(attempt);
            }
        }

        let mut work: Vec<Work> = due.into_iter().map(Work::Stage).collect();
        work.extend(
            retries
                .into_iter()
                .map(|(entity_id, attempts)| Work::Retries(entity_id, attempts)),
        );
        Ok(work)
    }

    async fn idle_wait(&self) -> Result<Duration> {
        let idle_poll = Duration::from_millis(self.config.idle_poll_ms.max(1));
        let next_stage = self.db.next_due_at().await?;
        let next_retry = attempts::next_retry_at(self.db.pool()).await?;
        let wake = match (next_stage, next_retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let now = self.clock.now();
        Ok(wake
            .filter(|at| *at > now)
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(idle_poll))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn process_item(
    db: Database,
    processor: Arc<StageProcessor>,
    clock: Arc<dyn Clock>,
    owner: String,
    lease: Duration,
    item: Work,
) -> Result<WorkResult> {
    let entity_id = item.entity_id().clone();
    if !db.claim(&entity_id, &owner, clock.now(), lease).await? {
        debug!(entity_id = %entity_id, "entity leased elsewhere");
        return Ok(WorkResult::Contended);
    }

    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn(renew_lease(
        db.clone(),
        Arc::clone(&clock),
        entity_id.clone(),
        owner.clone(),
        lease,
        stop.clone(),
    ));

    let work = AssertUnwindSafe(run_work(&db, &processor, clock.as_ref(), &entity_id, item))
        .catch_unwind()
        .await;
    stop.cancel();
    if let Err(e) = heartbeat.await {
        warn!(entity_id = %entity_id, error = %e, "lease renewal task ended abnormally");
    }

    let result = work.unwrap_or_else(|payload| {
        Err(SchedulerError::Panicked {
            entity_id: entity_id.clone(),
            message: panic_message(&*payload),
        })
    });

    if let Err(e) = db.release(&entity_id, &owner).await {
        warn!(entity_id = %entity_id, error = %e, "failed to release lease");
    }
    result
}

async fn run_work(
    db: &Database,
    processor: &StageProcessor,
    clock: &dyn Clock,
    entity_id: &EntityId,
    item: Work,
) -> Result<WorkResult> {
    match item {
        Work::Stage(_) => match db.load(entity_id).await? {
            Some(fresh) if fresh.is_due(clock.now()) => processor.process(fresh).await.map(WorkResult::Stage),
            _ => Ok(WorkResult::Contended),
        },
        Work::Retries(_, attempts) => {
            let mut done = Vec::with_capacity(attempts.len());
            for attempt in attempts {
                done.push(processor.retry_provider(attempt).await?);
            }
            Ok(WorkResult::Retries(done))
        }
    }
}

/// Extend `owner`'s lease every third of its length until `stop` fires.
async fn renew_lease(
    db: Database,
    clock: Arc<dyn Clock>,
    entity_id: EntityId,
    owner: String,
    lease: Duration,
    stop: CancellationToken,
) {
    let period = (lease / 3).max(MIN_RENEWAL_PERIOD);
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(period) => {}
        }
        match db.claim(&entity_id, &owner, clock.now(), lease).await {
            Ok(true) => debug!(entity_id = %entity_id, "lease renewed"),
            Ok(false) => warn!(entity_id = %entity_id, "lease lost to another owner"),
            Err(e) => warn!(entity_id = %entity_id, error = %e, "lease renewal failed"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
