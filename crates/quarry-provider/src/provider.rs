//! Core provider trait and outcome types.

use async_trait::async_trait;
use quarry_core::{CandidateRecord, Entity, ProviderId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Trait for enrichment sources.
///
/// Implementations must be thread-safe (Send + Sync) and must map their own
/// transport-level errors onto [`CandidateOutcome`]. In particular an
/// explicit rate-limit signal has to surface as `RateLimited` so the
/// limiter can apply its penalty.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static description of the provider.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Unique identifier for this provider.
    fn id(&self) -> &ProviderId {
        &self.descriptor().id
    }

    /// Look up candidate records for an entity.
    async fn lookup(&self, entity: &Entity) -> CandidateOutcome;
}

/// Static metadata the registry and merge engine need about a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Provider id
    pub id: ProviderId,
    /// Provenance weight stamped on every record (0.0-1.0)
    pub weight: f64,
    /// Locales covered; empty means every locale
    pub locales: Vec<String>,
    /// Sectors covered; empty means every sector
    pub sectors: Vec<String>,
}

impl ProviderDescriptor {
    /// Create a descriptor covering every locale and sector.
    #[must_use]
    pub fn new(id: ProviderId, weight: f64) -> Self {
        Self {
            id,
            weight: weight.clamp(0.0, 1.0),
            locales: Vec::new(),
            sectors: Vec::new(),
        }
    }

    /// Restrict the provider to the given locales.
    #[must_use]
    pub fn with_locales<I, S>(mut self, locales: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locales = locales.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the provider to the given sectors.
    #[must_use]
    pub fn with_sectors<I, S>(mut self, sectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sectors = sectors.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this provider should be asked about `entity`.
    ///
    /// An entity without a tag matches every provider on that axis. Locale
    /// matching is by primary subtag, so `de` covers `de-AT`.
    #[must_use]
    pub fn covers(&self, entity: &Entity) -> bool {
        let locale_ok = match (&entity.locale, self.locales.is_empty()) {
            (_, true) | (None, _) => true,
            (Some(locale), false) => {
                let primary = locale
                    .split(['-', '_'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                self.locales.iter().any(|l| {
                    let l = l.to_ascii_lowercase();
                    l == locale.to_ascii_lowercase() || l == primary
                })
            }
        };

        let sector_ok = match (&entity.sector, self.sectors.is_empty()) {
            (_, true) | (None, _) => true,
            (Some(sector), false) => self.sectors.iter().any(|s| s.eq_ignore_ascii_case(sector)),
        };

        locale_ok && sector_ok
    }
}

/// Result of asking one provider about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CandidateOutcome {
    /// One or more candidate records
    Success(Vec<CandidateRecord>),
    /// The provider answered but had nothing
    EmptyResult,
    /// Network timeout, 5xx-equivalent
    TransientFailure(String),
    /// Auth error, malformed input, explicit not-found
    PermanentFailure(String),
    /// Explicit rate-limit signal with an optional retry-after hint
    RateLimited(Option<Duration>),
}

impl CandidateOutcome {
    /// `Success` for a non-empty list, `EmptyResult` otherwise.
    #[must_use]
    pub fn from_records(records: Vec<CandidateRecord>) -> Self {
        if records.is_empty() {
            Self::EmptyResult
        } else {
            Self::Success(records)
        }
    }

    /// Whether the provider produced candidates.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the provider answered definitively (success or empty).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success(_) | Self::EmptyResult)
    }

    /// Whether the call may succeed if tried again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_) | Self::RateLimited(_))
    }

    /// Whether the call failed for good.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentFailure(_))
    }

    /// Candidate records, empty unless `Success`.
    #[must_use]
    pub fn records(&self) -> &[CandidateRecord] {
        match self {
            Self::Success(records) => records,
            _ => &[],
        }
    }

    /// Retry-after hint carried by a `RateLimited` outcome.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(hint) => *hint,
            _ => None,
        }
    }

    /// Short stable label used in logs and the attempts table.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::EmptyResult => "empty",
            Self::TransientFailure(_) => "transient_failure",
            Self::PermanentFailure(_) => "permanent_failure",
            Self::RateLimited(_) => "rate_limited",
        }
    }
}

impl fmt::Display for CandidateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(records) => write!(f, "success ({} records)", records.len()),
            Self::EmptyResult => write!(f, "empty result"),
            Self::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
            Self::PermanentFailure(reason) => write!(f, "permanent failure: {reason}"),
            Self::RateLimited(Some(hint)) => write!(f, "rate limited, retry after {hint:?}"),
            Self::RateLimited(None) => write!(f, "rate limited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quarry_core::EntityId;

    fn entity() -> Entity {
        Entity::new(EntityId::new("e1").expect("valid id"), "Acme")
    }

    #[test]
    fn test_descriptor_covers_untagged_entity() {
        let descriptor = ProviderDescriptor::new(ProviderId::new("dir").expect("id"), 0.5)
            .with_locales(["de"])
            .with_sectors(["legal"]);
        assert!(descriptor.covers(&entity()));
    }

    #[test]
    fn test_descriptor_locale_matching() {
        let descriptor =
            ProviderDescriptor::new(ProviderId::new("dir").expect("id"), 0.5).with_locales(["de"]);
        assert!(descriptor.covers(&entity().with_locale("de-AT")));
        assert!(descriptor.covers(&entity().with_locale("DE")));
        assert!(!descriptor.covers(&entity().with_locale("fr")));
    }

    #[test]
    fn test_descriptor_sector_matching() {
        let descriptor = ProviderDescriptor::new(ProviderId::new("dir").expect("id"), 0.5)
            .with_sectors(["Legal"]);
        assert!(descriptor.covers(&entity().with_sector("legal")));
        assert!(!descriptor.covers(&entity().with_sector("retail")));
    }

    #[test]
    fn test_descriptor_clamps_weight() {
        let descriptor = ProviderDescriptor::new(ProviderId::new("dir").expect("id"), 1.7);
        assert!((descriptor.weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_outcome_from_records() {
        assert_eq!(
            CandidateOutcome::from_records(Vec::new()),
            CandidateOutcome::EmptyResult
        );

        let record = CandidateRecord::new(
            ProviderId::new("dir").expect("id"),
            EntityId::new("e1").expect("id"),
            0.5,
            Utc::now(),
        );
        let outcome = CandidateOutcome::from_records(vec![record]);
        assert!(outcome.is_success());
        assert_eq!(outcome.records().len(), 1);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(CandidateOutcome::TransientFailure("timeout".into()).is_retryable());
        assert!(CandidateOutcome::RateLimited(None).is_retryable());
        assert!(CandidateOutcome::PermanentFailure("401".into()).is_permanent());
        assert!(CandidateOutcome::EmptyResult.is_settled());
        assert_eq!(
            CandidateOutcome::RateLimited(Some(Duration::from_secs(9))).retry_after(),
            Some(Duration::from_secs(9))
        );
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let json = serde_json::to_string(&CandidateOutcome::PermanentFailure("gone".into()))
            .expect("serialize outcome");
        assert_eq!(json, r#"{"outcome":"permanent_failure","detail":"gone"}"#);
    }
}
