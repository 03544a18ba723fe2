//! Field validation.
//!
//! A [`FieldValidator`] turns a raw provider value into its canonical form or
//! rejects it. Validators must be idempotent: a canonical value validates to
//! itself, so extraction and merge can both run them.

use crate::error::ValidationError;
use crate::similarity::NameKey;
use once_cell::sync::Lazy;
use quarry_core::{CandidateRecord, FieldKind};
use regex::Regex;
use std::collections::BTreeMap;

static PERSON_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\p{L}[\p{L}\p{M}'.\- ]*$").expect("person name regex is hardcoded and valid")
});

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .expect("email regex is hardcoded and valid")
});

static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9 ()./\-]+$").expect("phone regex is hardcoded and valid"));

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(https?://)?([a-z0-9\-]+\.)+[a-z]{2,}(:[0-9]+)?(/\S*)?$")
        .expect("url regex is hardcoded and valid")
});

const MAX_NAME_LEN: usize = 100;
const MAX_TEXT_LEN: usize = 200;

/// Validates and canonicalises candidate field values.
pub trait FieldValidator: Send + Sync {
    /// Canonical form of `value` for `field`, or why it is malformed.
    fn validate(&self, field: &str, value: &str) -> Result<String, ValidationError>;
}

/// Pattern-based validator keyed on [`FieldKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl FieldValidator for DefaultValidator {
    fn validate(&self, field: &str, value: &str) -> Result<String, ValidationError> {
        let collapsed = collapse_whitespace(value);
        if collapsed.is_empty() {
            return Err(ValidationError::new(field, value, "empty"));
        }

        match FieldKind::classify(field) {
            FieldKind::PersonName => {
                if collapsed.chars().count() > MAX_NAME_LEN {
                    return Err(ValidationError::new(field, value, "too long"));
                }
                if !PERSON_NAME_PATTERN.is_match(&collapsed) {
                    return Err(ValidationError::new(field, value, "not a person name"));
                }
                if NameKey::parse(&collapsed).is_empty() {
                    return Err(ValidationError::new(field, value, "honorific only"));
                }
                Ok(collapsed)
            }
            FieldKind::Email => {
                if !EMAIL_PATTERN.is_match(&collapsed) {
                    return Err(ValidationError::new(field, value, "not an email address"));
                }
                Ok(collapsed.to_lowercase())
            }
            FieldKind::Phone => {
                let digits = collapsed.chars().filter(char::is_ascii_digit).count();
                if !PHONE_PATTERN.is_match(&collapsed) || !(7..=15).contains(&digits) {
                    return Err(ValidationError::new(field, value, "not a phone number"));
                }
                Ok(collapsed)
            }
            FieldKind::Url => {
                if !URL_PATTERN.is_match(&collapsed) {
                    return Err(ValidationError::new(field, value, "not a url"));
                }
                Ok(collapsed)
            }
            FieldKind::Title | FieldKind::Text => {
                if collapsed.chars().count() > MAX_TEXT_LEN {
                    return Err(ValidationError::new(field, value, "too long"));
                }
                if !collapsed.chars().any(char::is_alphanumeric) {
                    return Err(ValidationError::new(field, value, "no content"));
                }
                Ok(collapsed)
            }
        }
    }
}

/// A record's fields after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanFields {
    /// Canonical values of the fields that passed
    pub fields: BTreeMap<String, String>,
    /// Fields rejected as malformed
    pub rejected: Vec<ValidationError>,
}

/// Run every field of `record` through `validator`.
#[must_use]
pub fn clean_record(validator: &dyn FieldValidator, record: &CandidateRecord) -> CleanFields {
    let mut clean = CleanFields::default();
    for (field, value) in &record.fields {
        match validator.validate(field, value) {
            Ok(canonical) => {
                clean.fields.insert(field.clone(), canonical);
            }
            Err(e) => {
                tracing::debug!(
                    entity_id = %record.entity_id,
                    provider_id = %record.provider_id,
                    error = %e,
                    "dropped malformed field"
                );
                clean.rejected.push(e);
            }
        }
    }
    clean
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
