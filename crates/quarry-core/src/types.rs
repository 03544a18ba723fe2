//! Shared types used across the Quarry engine.
//!
//! This module defines the identifier newtypes, the immutable `Entity` being
//! enriched and the `CandidateRecord` a provider returns for it.

use crate::error::QuarryError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Newtype for entity identifiers with validation.
///
/// Entity IDs are the stable key of a batch input row: 1-128 characters of
/// ASCII alphanumerics, `.`, `_`, `:` or `-`, starting with an alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new `EntityId` from a string.
    ///
    /// # Errors
    /// Returns error if the ID doesn't match the required format.
    pub fn new(id: impl Into<String>) -> Result<Self, QuarryError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), QuarryError> {
        static ENTITY_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ENTITY_REGEX
            .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,127}$").expect("valid regex"));

        if regex.is_match(id) {
            Ok(())
        } else {
            Err(QuarryError::Validation(format!(
                "invalid entity ID: must be 1-128 alphanumeric/._:- characters, got '{id}'"
            )))
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for provider identifiers with validation.
///
/// Provider IDs must be lowercase alphanumeric with hyphens or underscores,
/// 1-64 characters, and may not start or end with a separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a new `ProviderId` from a string.
    ///
    /// # Errors
    /// Returns error if the ID doesn't match the required format.
    pub fn new(id: impl Into<String>) -> Result<Self, QuarryError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), QuarryError> {
        static PROVIDER_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = PROVIDER_REGEX.get_or_init(|| {
            Regex::new(r"^[a-z0-9](?:[a-z0-9_-]{0,62}[a-z0-9])?$").expect("valid regex")
        });

        if regex.is_match(id) {
            Ok(())
        } else {
            Err(QuarryError::Validation(format!(
                "invalid provider ID: must be lowercase alphanumeric with hyphens, got '{id}'"
            )))
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A business entity being enriched.
///
/// Created once per batch input row and never mutated afterwards. The
/// `locale` and `sector` tags only influence which providers are selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable key for the entity
    pub entity_id: EntityId,
    /// Company name
    pub name: String,
    /// Company website or domain, if known
    pub website: Option<String>,
    /// Locale tag (e.g. `de`, `en-gb`)
    pub locale: Option<String>,
    /// Sector tag (e.g. `legal`, `manufacturing`)
    pub sector: Option<String>,
}

impl Entity {
    /// Create a new entity with the given id and name.
    #[must_use]
    pub fn new(entity_id: EntityId, name: impl Into<String>) -> Self {
        Self {
            entity_id,
            name: name.into(),
            website: None,
            locale: None,
            sector: None,
        }
    }

    /// Set the website.
    #[must_use]
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    /// Set the locale tag.
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Set the sector tag.
    #[must_use]
    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    /// Check that the entity carries enough input to be enriched.
    ///
    /// # Errors
    /// Returns `QuarryError::Validation` if the name is blank.
    pub fn validate(&self) -> Result<(), QuarryError> {
        if self.name.trim().is_empty() {
            return Err(QuarryError::Validation(format!(
                "entity {} has an empty name",
                self.entity_id
            )));
        }
        Ok(())
    }

    /// Key used when caching provider results for this entity.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.entity_id.as_str().to_string()
    }
}

/// Category of a candidate field, used to pick a validator and similarity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A person's name
    PersonName,
    /// Job title or position
    Title,
    /// Email address
    Email,
    /// Phone number
    Phone,
    /// Profile or website URL
    Url,
    /// Any other free-text field
    Text,
}

impl FieldKind {
    /// Classify a field name reported by a provider.
    #[must_use]
    pub fn classify(field_name: &str) -> Self {
        match field_name.trim().to_ascii_lowercase().as_str() {
            "full_name" | "name" | "contact_name" | "executive_name" | "person_name" => {
                Self::PersonName
            }
            "title" | "job_title" | "position" | "role" => Self::Title,
            "email" | "contact_email" | "email_address" => Self::Email,
            "phone" | "telephone" | "phone_number" | "mobile" => Self::Phone,
            "profile_url" | "linkedin_url" | "url" | "website" => Self::Url,
            _ => Self::Text,
        }
    }
}

/// One provider's raw finding for an entity.
///
/// Immutable once created. `fields` is an ordered map so serialised records
/// are stable regardless of how the provider built them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Provider that produced the record
    pub provider_id: ProviderId,
    /// Entity the record belongs to
    pub entity_id: EntityId,
    /// Field name to raw value
    pub fields: BTreeMap<String, String>,
    /// Static reliability score of the provider (0.0-1.0)
    pub provenance_weight: f64,
    /// When the provider returned the record
    pub fetched_at: DateTime<Utc>,
}

impl CandidateRecord {
    /// Create an empty candidate record.
    #[must_use]
    pub fn new(
        provider_id: ProviderId,
        entity_id: EntityId,
        provenance_weight: f64,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id,
            entity_id,
            fields: BTreeMap::new(),
            provenance_weight,
            fetched_at,
        }
    }

    /// Add a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}
