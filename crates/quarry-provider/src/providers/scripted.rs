//! Deterministic provider driven by a per-entity script.
//!
//! Each entity gets a queue of outcomes. Every lookup pops the next one; the
//! last outcome repeats once the queue is down to a single entry. Entities
//! without a script receive the default outcome (`EmptyResult` unless set).

use crate::provider::{CandidateOutcome, Provider, ProviderDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::{CandidateRecord, Entity, EntityId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Provider that replays scripted outcomes.
pub struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    scripts: Mutex<HashMap<EntityId, VecDeque<CandidateOutcome>>>,
    default_outcome: CandidateOutcome,
    calls: Mutex<HashMap<EntityId, u32>>,
    delay: Option<Duration>,
    fetched_at: DateTime<Utc>,
}

impl ScriptedProvider {
    /// Create a provider that answers `EmptyResult` for every entity.
    #[must_use]
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            scripts: Mutex::new(HashMap::new()),
            default_outcome: CandidateOutcome::EmptyResult,
            calls: Mutex::new(HashMap::new()),
            delay: None,
            fetched_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Outcome for entities without a script.
    #[must_use]
    pub fn with_default(mut self, outcome: CandidateOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Sleep for `delay` (tokio time) before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Timestamp stamped on generated records.
    #[must_use]
    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Queue outcomes for an entity.
    #[must_use]
    pub fn script<I>(self, entity_id: &EntityId, outcomes: I) -> Self
    where
        I: IntoIterator<Item = CandidateOutcome>,
    {
        self.scripts
            .lock()
            .expect("acquire scripts lock")
            .entry(entity_id.clone())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Queue a single success made of one record per field list.
    #[must_use]
    pub fn respond_with<'a, I, F>(self, entity_id: &EntityId, records: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let records = records
            .into_iter()
            .map(|fields| self.record(entity_id, fields))
            .collect();
        self.script(entity_id, [CandidateOutcome::from_records(records)])
    }

    /// Build a record carrying this provider's id and weight.
    #[must_use]
    pub fn record<'a, F>(&self, entity_id: &EntityId, fields: F) -> CandidateRecord
    where
        F: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fields.into_iter().fold(
            CandidateRecord::new(
                self.descriptor.id.clone(),
                entity_id.clone(),
                self.descriptor.weight,
                self.fetched_at,
            ),
            |record, (name, value)| record.with_field(name, value),
        )
    }

    /// Lookups made for one entity so far.
    #[must_use]
    pub fn calls_for(&self, entity_id: &EntityId) -> u32 {
        self.calls
            .lock()
            .expect("acquire calls lock")
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }

    /// Lookups made across all entities.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().expect("acquire calls lock").values().sum()
    }

    fn next_outcome(&self, entity_id: &EntityId) -> CandidateOutcome {
        let mut scripts = self.scripts.lock().expect("acquire scripts lock");
        match scripts.get_mut(entity_id) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| self.default_outcome.clone()),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| self.default_outcome.clone()),
            None => self.default_outcome.clone(),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn lookup(&self, entity: &Entity) -> CandidateOutcome {
        *self
            .calls
            .lock()
            .expect("acquire calls lock")
            .entry(entity.entity_id.clone())
            .or_insert(0) += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.next_outcome(&entity.entity_id);
        debug!(
            provider_id = %self.descriptor.id,
            entity_id = %entity.entity_id,
            outcome = outcome.label(),
            "scripted lookup"
        );
        outcome
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("descriptor", &self.descriptor)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
