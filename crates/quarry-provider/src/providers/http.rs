//! Generic JSON-over-HTTP provider.
//!
//! Queries `GET {endpoint}?name=..&website=..&locale=..` and expects a body of
//! the form `{"records": [{"full_name": "...", "title": "..."}, ...]}`.
//! Transport and status errors are mapped onto the outcome taxonomy.

use crate::error::{ProviderError, Result};
use crate::provider::{CandidateOutcome, Provider, ProviderDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::{CandidateRecord, Entity, ProviderConfig, ProviderId};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider backed by a JSON HTTP endpoint.
pub struct HttpJsonProvider {
    descriptor: ProviderDescriptor,
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpJsonProvider {
    /// Build a provider from its configuration entry.
    ///
    /// # Errors
    /// Returns error if the id is invalid, the endpoint is empty, the
    /// configured API key variable is unset, or the HTTP client cannot be
    /// created.
    pub fn from_config(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let id = ProviderId::new(config.id.clone())?;

        if config.endpoint.trim().is_empty() {
            return Err(ProviderError::InvalidConfig {
                provider_id: config.id.clone(),
                reason: "endpoint must not be empty".to_string(),
            });
        }

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| ProviderError::InvalidConfig {
                provider_id: config.id.clone(),
                reason: format!("environment variable {var} is not set"),
            })?),
            None => None,
        };

        let client = Client::builder().timeout(timeout).build()?;

        let descriptor = ProviderDescriptor::new(id, config.weight)
            .with_locales(config.locales.iter().cloned())
            .with_sectors(config.sectors.iter().cloned());

        Ok(Self {
            descriptor,
            endpoint: config.endpoint.clone(),
            api_key,
            client,
        })
    }

    async fn request(&self, entity: &Entity) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut query: Vec<(&str, &str)> = vec![("name", entity.name.as_str())];
        if let Some(website) = &entity.website {
            query.push(("website", website));
        }
        if let Some(locale) = &entity.locale {
            query.push(("locale", locale));
        }

        let mut request = self.client.get(&self.endpoint).query(&query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn lookup(&self, entity: &Entity) -> CandidateOutcome {
        let response = match self.request(entity).await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            let outcome = classify_status(status, retry_after);
            warn!(
                provider_id = %self.descriptor.id,
                entity_id = %entity.entity_id,
                status = status.as_u16(),
                outcome = outcome.label(),
                "provider returned error status"
            );
            return outcome;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport_error(&e),
        };

        let outcome = parse_body(&body, &self.descriptor, entity, Utc::now());
        debug!(
            provider_id = %self.descriptor.id,
            entity_id = %entity.entity_id,
            outcome = outcome.label(),
            "provider lookup complete"
        );
        outcome
    }
}

impl std::fmt::Debug for HttpJsonProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonProvider")
            .field("descriptor", &self.descriptor)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Map a non-success HTTP status onto the outcome taxonomy.
#[must_use]
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> CandidateOutcome {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CandidateOutcome::RateLimited(retry_after),
        StatusCode::REQUEST_TIMEOUT => {
            CandidateOutcome::TransientFailure(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => {
            CandidateOutcome::TransientFailure(format!("HTTP {}", s.as_u16()))
        }
        s => CandidateOutcome::PermanentFailure(format!("HTTP {}", s.as_u16())),
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn classify_transport_error(error: &reqwest::Error) -> CandidateOutcome {
    if error.is_timeout() {
        CandidateOutcome::TransientFailure(format!("timeout: {error}"))
    } else if error.is_builder() {
        CandidateOutcome::PermanentFailure(format!("invalid request: {error}"))
    } else {
        CandidateOutcome::TransientFailure(format!("transport error: {error}"))
    }
}

#[derive(Debug, Deserialize)]
struct RecordsBody {
    #[serde(default)]
    records: Vec<BTreeMap<String, serde_json::Value>>,
}

/// Turn a response body into an outcome. Malformed JSON is transient.
fn parse_body(
    body: &str,
    descriptor: &ProviderDescriptor,
    entity: &Entity,
    fetched_at: DateTime<Utc>,
) -> CandidateOutcome {
    let parsed: RecordsBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => return CandidateOutcome::TransientFailure(format!("malformed response: {e}")),
    };

    let records = parsed
        .records
        .into_iter()
        .map(|raw| {
            let mut record = CandidateRecord::new(
                descriptor.id.clone(),
                entity.entity_id.clone(),
                descriptor.weight,
                fetched_at,
            );
            for (name, value) in raw {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                record.fields.insert(name, value);
            }
            record
        })
        .filter(|record| !record.fields.is_empty())
        .collect();

    CandidateOutcome::from_records(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::EntityId;

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor::new(ProviderId::new("registry").expect("valid id"), 0.8)
    }

    fn entity() -> Entity {
        Entity::new(EntityId::new("acme").expect("valid id"), "Acme")
    }

    fn config(id: &str, endpoint: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            weight: 0.7,
            locales: vec!["de".to_string()],
            sectors: Vec::new(),
            api_key_env: None,
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(30))),
            CandidateOutcome::RateLimited(Some(Duration::from_secs(30)))
        );
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None).is_retryable());
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(classify_status(status, None).is_permanent(), "{status}");
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after(" 120 ", Utc::now()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .expect("valid date")
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:29:30 GMT", now),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_body_records() {
        let body = r#"{"records": [
            {"full_name": "Jane Doe", "title": "Director", "extension": 42, "notes": null},
            {}
        ]}"#;
        let outcome = parse_body(body, &descriptor(), &entity(), Utc::now());

        let records = outcome.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("full_name"), Some("Jane Doe"));
        assert_eq!(records[0].field("extension"), Some("42"));
        assert_eq!(records[0].field("notes"), None);
        assert!((records[0].provenance_weight - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_body_empty_and_malformed() {
        assert_eq!(
            parse_body(r#"{"records": []}"#, &descriptor(), &entity(), Utc::now()),
            CandidateOutcome::EmptyResult
        );
        assert!(parse_body("<html>", &descriptor(), &entity(), Utc::now()).is_retryable());
    }

    #[test]
    fn test_from_config() {
        let provider = HttpJsonProvider::from_config(
            &config("registry", "https://registry.example/api"),
            Duration::from_secs(5),
        )
        .expect("build provider");
        assert_eq!(provider.id().as_str(), "registry");
        assert_eq!(provider.descriptor().locales, vec!["de".to_string()]);
    }

    #[test]
    fn test_from_config_rejects_bad_input() {
        let result = HttpJsonProvider::from_config(&config("Bad Id", "https://x"), Duration::from_secs(5));
        assert!(matches!(result, Err(ProviderError::InvalidId(_))));

        let result = HttpJsonProvider::from_config(&config("registry", "  "), Duration::from_secs(5));
        assert!(matches!(result, Err(ProviderError::InvalidConfig { .. })));

        let mut cfg = config("registry", "https://x");
        cfg.api_key_env = Some("QUARRY_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        let result = HttpJsonProvider::from_config(&cfg, Duration::from_secs(5));
        assert!(matches!(result, Err(ProviderError::InvalidConfig { .. })));
    }
}
