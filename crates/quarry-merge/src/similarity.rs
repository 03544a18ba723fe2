//! Similarity keys: values with equal keys describe the same fact.

use crate::validator::collapse_whitespace;
use quarry_core::FieldKind;

const HONORIFICS: &[&str] = &[
    "mr", "mrs", "ms", "miss", "mx", "dr", "prof", "sir", "dame", "herr", "frau", "mag", "ing", "dipl",
];

/// Grouping key for a canonical field value.
#[must_use]
pub fn similarity_key(kind: FieldKind, value: &str) -> String {
    match kind {
        FieldKind::PersonName => NameKey::parse(value).joined(),
        FieldKind::Email => value.trim().to_lowercase(),
        FieldKind::Phone => value.chars().filter(char::is_ascii_digit).collect(),
        FieldKind::Url => url_key(value),
        FieldKind::Title | FieldKind::Text => collapse_whitespace(value).to_lowercase(),
    }
}

fn url_key(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}

/// Normalised tokens of a person name.
///
/// Lower-cased, punctuation stripped, honorifics removed. A token of length
/// one is an initial.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NameKey {
    tokens: Vec<String>,
}

impl NameKey {
    /// Parse a person name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let tokens = value
            .split(|c: char| c.is_whitespace() || c == '.' || c == ',')
            .map(|token| {
                token
                    .chars()
                    .filter(|c| c.is_alphanumeric())
                    .flat_map(char::to_lowercase)
                    .collect::<String>()
            })
            .filter(|token| !token.is_empty() && !HONORIFICS.contains(&token.as_str()))
            .collect();
        Self { tokens }
    }

    /// Whether nothing but honorifics and punctuation was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether any given name is reduced to an initial.
    #[must_use]
    pub fn is_abbreviated(&self) -> bool {
        self.tokens.len() > 1
            && self.tokens[..self.tokens.len() - 1]
                .iter()
                .any(|token| token.chars().count() == 1)
    }

    /// Whether this (abbreviated) name may stand for `full`.
    ///
    /// Same token count and surname; every given name equal or an initial of
    /// the corresponding full given name.
    #[must_use]
    pub fn abbreviates(&self, full: &Self) -> bool {
        if self.tokens.len() < 2 || self.tokens.len() != full.tokens.len() || full.is_abbreviated() {
            return false;
        }
        let last = self.tokens.len() - 1;
        if self.tokens[last] != full.tokens[last] || self.tokens[last].chars().count() == 1 {
            return false;
        }
        self.tokens[..last]
            .iter()
            .zip(&full.tokens[..last])
            .all(|(short, long)| short == long || (short.chars().count() == 1 && long.starts_with(short.as_str())))
    }

    /// Tokens joined by single spaces.
    #[must_use]
    pub fn joined(&self) -> String {
        self.tokens.join(" ")
    }
}
