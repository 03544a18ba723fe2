//! Merge and confidence scoring.
//!
//! For each field, valid values are grouped by similarity key. A group's raw
//! score is the sum, over distinct providers, of each provider's best weight
//! in the group. The highest-scoring group wins with confidence
//! `raw / (raw + base_penalty + competing raw)`.
//!
//! Everything iterates in a canonical order (sorted candidates, `BTreeMap`
//! groups, providers by id), so any permutation of the same candidates
//! serialises to identical bytes.

use crate::error::{MergeError, Result};
use crate::profile::{MergedProfile, ResolvedField};
use crate::similarity::{similarity_key, NameKey};
use crate::validator::{DefaultValidator, FieldValidator};
use quarry_core::{CandidateRecord, EntityId, FieldKind, MergeConfig, ProviderId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Member {
    provider_id: ProviderId,
    weight: f64,
    value: String,
    full_form: bool,
}

#[derive(Debug, Default)]
struct Group {
    members: Vec<Member>,
}

impl Group {
    fn raw_score(&self) -> f64 {
        let mut best: BTreeMap<&ProviderId, f64> = BTreeMap::new();
        for member in &self.members {
            let entry = best.entry(&member.provider_id).or_insert(0.0);
            if member.weight > *entry {
                *entry = member.weight;
            }
        }
        best.values().sum()
    }

    fn providers(&self) -> BTreeSet<ProviderId> {
        self.members.iter().map(|m| m.provider_id.clone()).collect()
    }
}

/// Merges candidate records into profiles.
#[derive(Clone)]
pub struct MergeEngine {
    validator: Arc<dyn FieldValidator>,
    config: MergeConfig,
}

impl MergeEngine {
    /// Engine with the default validator.
    ///
    /// # Errors
    /// Returns `MergeError::InvalidConfig` for a non-positive base penalty or
    /// a floor outside `[0, 1]`.
    pub fn new(config: MergeConfig) -> Result<Self> {
        Self::with_validator(config, Arc::new(DefaultValidator))
    }

    /// Engine with a custom validator.
    ///
    /// # Errors
    /// Same as [`MergeEngine::new`].
    pub fn with_validator(config: MergeConfig, validator: Arc<dyn FieldValidator>) -> Result<Self> {
        if config.base_penalty.is_nan() || config.base_penalty <= 0.0 {
            return Err(MergeError::InvalidConfig("base_penalty must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&config.confidence_floor) {
            return Err(MergeError::InvalidConfig(
                "confidence_floor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(Self { validator, config })
    }

    /// The validator shared with the extraction stage.
    #[must_use]
    pub fn validator(&self) -> &dyn FieldValidator {
        self.validator.as_ref()
    }

    /// Merge all candidates of one entity.
    ///
    /// The result is unqualified; see [`MergeEngine::qualify`].
    ///
    /// # Errors
    /// Returns `MergeError::EntityMismatch` if a candidate belongs to another
    /// entity.
    pub fn merge(&self, entity_id: &EntityId, candidates: &[CandidateRecord]) -> Result<MergedProfile> {
        if let Some(stray) = candidates.iter().find(|c| &c.entity_id != entity_id) {
            return Err(MergeError::EntityMismatch {
                expected: entity_id.clone(),
                found: stray.entity_id.clone(),
            });
        }

        let mut sorted: Vec<&CandidateRecord> = candidates.iter().collect();
        sorted.sort_by(|a, b| canonical_order(a, b));

        let mut profile = MergedProfile::empty(entity_id.clone());
        let mut values: BTreeMap<&str, Vec<Member>> = BTreeMap::new();

        for candidate in &sorted {
            let weight = self.weight_of(candidate);
            for (field, raw) in &candidate.fields {
                match self.validator.validate(field, raw) {
                    Ok(value) => values.entry(field.as_str()).or_default().push(Member {
                        provider_id: candidate.provider_id.clone(),
                        weight,
                        value,
                        full_form: true,
                    }),
                    Err(e) => {
                        debug!(entity_id = %entity_id, error = %e, "merge dropped malformed value");
                        profile.dropped_fields += 1;
                    }
                }
            }
        }

        for (field, members) in values {
            let groups = group_members(FieldKind::classify(field), members);
            if let Some(resolved) = self.resolve(&groups) {
                if resolved.confidence >= self.config.confidence_floor {
                    profile.fields.insert(field.to_string(), resolved);
                } else {
                    debug!(
                        entity_id = %entity_id,
                        field,
                        confidence = resolved.confidence,
                        "field below confidence floor"
                    );
                }
            }
        }

        Ok(profile)
    }

    /// Set qualification output from the configured required fields.
    pub fn qualify(&self, profile: &mut MergedProfile) {
        profile.qualify(&self.config.required_fields);
    }

    fn weight_of(&self, candidate: &CandidateRecord) -> f64 {
        let weight = self
            .config
            .provider_weights
            .get(candidate.provider_id.as_str())
            .copied()
            .unwrap_or(candidate.provenance_weight);
        if weight.is_nan() {
            0.0
        } else {
            weight.clamp(0.0, 1.0)
        }
    }

    fn priority_rank(&self, provider_id: &ProviderId) -> usize {
        self.config
            .provider_priority
            .iter()
            .position(|p| p == provider_id.as_str())
            .unwrap_or(usize::MAX)
    }

    fn group_rank(&self, group: &Group) -> (usize, Option<ProviderId>) {
        let rank = group
            .members
            .iter()
            .map(|m| self.priority_rank(&m.provider_id))
            .min()
            .unwrap_or(usize::MAX);
        let first = group.members.iter().map(|m| m.provider_id.clone()).min();
        (rank, first)
    }

    fn resolve(&self, groups: &BTreeMap<String, Group>) -> Option<ResolvedField> {
        let scored: Vec<(&String, &Group, f64)> = groups
            .iter()
            .map(|(key, group)| (key, group, group.raw_score()))
            .collect();

        let (winner_key, winner, raw) = scored.iter().copied().min_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| self.group_rank(a.1).cmp(&self.group_rank(b.1)))
                .then_with(|| a.0.cmp(b.0))
        })?;

        let competing: f64 = scored
            .iter()
            .filter(|(key, _, _)| *key != winner_key)
            .map(|(_, _, score)| score)
            .sum();
        let denominator = raw + self.config.base_penalty + competing;
        let confidence = if denominator > 0.0 {
            (raw / denominator).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let display = winner
            .members
            .iter()
            .min_by(|a, b| {
                b.full_form
                    .cmp(&a.full_form)
                    .then_with(|| b.weight.total_cmp(&a.weight))
                    .then_with(|| self.priority_rank(&a.provider_id).cmp(&self.priority_rank(&b.provider_id)))
                    .then_with(|| a.provider_id.cmp(&b.provider_id))
                    .then_with(|| a.value.cmp(&b.value))
            })?;

        Some(ResolvedField {
            value: display.value.clone(),
            confidence,
            supporting_providers: winner.providers(),
        })
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn canonical_order(a: &CandidateRecord, b: &CandidateRecord) -> Ordering {
    a.provider_id
        .cmp(&b.provider_id)
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
        .then_with(|| a.fields.cmp(&b.fields))
        .then_with(|| a.provenance_weight.total_cmp(&b.provenance_weight))
}

/// Group members by similarity key.
///
/// Abbreviated person names join the single full-name group they are
/// compatible with; with zero or several candidates they keep their own key.
fn group_members(kind: FieldKind, members: Vec<Member>) -> BTreeMap<String, Group> {
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    if kind != FieldKind::PersonName {
        for member in members {
            groups
                .entry(similarity_key(kind, &member.value))
                .or_default()
                .members
                .push(member);
        }
        return groups;
    }

    let mut abbreviated = Vec::new();
    for member in members {
        let key = NameKey::parse(&member.value);
        if key.is_abbreviated() {
            abbreviated.push((key, member));
        } else {
            groups.entry(key.joined()).or_default().members.push(member);
        }
    }

    let full_keys: Vec<(String, NameKey)> = groups
        .keys()
        .map(|joined| (joined.clone(), NameKey::parse(joined)))
        .collect();

    for (key, mut member) in abbreviated {
        let mut compatible = full_keys.iter().filter(|(_, full)| key.abbreviates(full));
        let target = match (compatible.next(), compatible.next()) {
            (Some((joined, _)), None) => joined.clone(),
            _ => key.joined(),
        };
        member.full_form = false;
        groups.entry(target).or_default().members.push(member);
    }

    groups
}
