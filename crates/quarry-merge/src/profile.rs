//! Merged profile types.

use quarry_core::{EntityId, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The winning value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    /// Canonical display value
    pub value: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Providers whose candidates agree with `value`
    pub supporting_providers: BTreeSet<ProviderId>,
}

/// Best current knowledge about one entity.
///
/// Recomputed from the full candidate set whenever it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedProfile {
    /// Entity the profile describes
    pub entity_id: EntityId,
    /// Published fields by name
    pub fields: BTreeMap<String, ResolvedField>,
    /// Malformed values rejected on the way in
    pub dropped_fields: u32,
    /// Whether every required field is present
    pub qualified: bool,
    /// Mean confidence of published fields
    pub quality_score: f64,
}

impl MergedProfile {
    /// Empty, unqualified profile.
    #[must_use]
    pub fn empty(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
            dropped_fields: 0,
            qualified: false,
            quality_score: 0.0,
        }
    }

    /// Value of a published field.
    #[must_use]
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|f| f.value.as_str())
    }

    /// Compute `qualified` and `quality_score`.
    pub fn qualify(&mut self, required_fields: &[String]) {
        self.qualified = required_fields.iter().all(|field| self.fields.contains_key(field));
        self.quality_score = if self.fields.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let count = self.fields.len() as f64;
            self.fields.values().map(|f| f.confidence).sum::<f64>() / count
        };
    }

    /// Stable JSON form.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(value: &str, confidence: f64) -> ResolvedField {
        ResolvedField {
            value: value.to_string(),
            confidence,
            supporting_providers: BTreeSet::new(),
        }
    }

    #[test]
    fn test_qualify() {
        let mut profile = MergedProfile::empty(EntityId::new("acme").expect("valid id"));
        profile.qualify(&["full_name".to_string()]);
        assert!(!profile.qualified);
        assert!(profile.quality_score.abs() < f64::EPSILON);

        profile.fields.insert("full_name".to_string(), field("Jane Doe", 0.8));
        profile.fields.insert("title".to_string(), field("Director", 0.6));
        profile.qualify(&["full_name".to_string()]);
        assert!(profile.qualified);
        assert!((profile.quality_score - 0.7).abs() < 1e-9);
        assert_eq!(profile.value("title"), Some("Director"));
    }

    #[test]
    fn test_no_required_fields_qualifies() {
        let mut profile = MergedProfile::empty(EntityId::new("acme").expect("valid id"));
        profile.qualify(&[]);
        assert!(profile.qualified);
    }
}
