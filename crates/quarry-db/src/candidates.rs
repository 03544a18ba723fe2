//! Stored candidate records.
//!
//! Raw provider output lands in `raw_fields`; the extraction stage writes the
//! validated subset to `clean_fields`. Re-fetching a provider replaces its
//! rows for that entity, so a retried provider never duplicates records.

use crate::codec::{decode_entity_id, decode_provider_id, decode_ts, encode_ts};
use crate::error::Result;
use quarry_core::{CandidateRecord, EntityId, ProviderId};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;

/// A candidate row with its validation result, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCandidate {
    /// Row id
    pub id: i64,
    /// Record as returned by the provider
    pub record: CandidateRecord,
    /// Fields that passed validation, once extraction has run
    pub clean_fields: Option<BTreeMap<String, String>>,
}

impl StoredCandidate {
    /// The record restricted to its validated fields.
    ///
    /// `None` until extraction has run for this row.
    #[must_use]
    pub fn clean_record(&self) -> Option<CandidateRecord> {
        self.clean_fields.as_ref().map(|fields| CandidateRecord {
            fields: fields.clone(),
            ..self.record.clone()
        })
    }
}

/// Replace every stored candidate of `provider_id` for `entity_id`.
///
/// # Errors
/// Returns error if serialisation or any write fails; the replacement is
/// atomic.
pub async fn replace_candidates(
    pool: &Pool<Sqlite>,
    entity_id: &EntityId,
    provider_id: &ProviderId,
    records: &[CandidateRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM candidates WHERE entity_id = ? AND provider_id = ?")
        .bind(entity_id.as_str())
        .bind(provider_id.as_str())
        .execute(&mut *tx)
        .await?;

    for record in records {
        sqlx::query(
            "INSERT INTO candidates (entity_id, provider_id, raw_fields, provenance_weight, fetched_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entity_id.as_str())
        .bind(provider_id.as_str())
        .bind(serde_json::to_string(&record.fields)?)
        .bind(record.provenance_weight)
        .bind(encode_ts(&record.fetched_at))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(
        entity_id = %entity_id,
        provider_id = %provider_id,
        count = records.len(),
        "stored candidates"
    );
    Ok(())
}

/// All candidates for an entity, ordered by provider then insertion.
///
/// # Errors
/// Returns error if the query fails or a row cannot be decoded.
pub async fn list_candidates(pool: &Pool<Sqlite>, entity_id: &EntityId) -> Result<Vec<StoredCandidate>> {
    let rows = sqlx::query(
        "SELECT id, entity_id, provider_id, raw_fields, clean_fields, provenance_weight, fetched_at
         FROM candidates WHERE entity_id = ? ORDER BY provider_id, id",
    )
    .bind(entity_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<StoredCandidate> {
            let raw_fields: String = row.try_get("raw_fields")?;
            let clean_fields: Option<String> = row.try_get("clean_fields")?;
            let fetched_at: String = row.try_get("fetched_at")?;

            Ok(StoredCandidate {
                id: row.try_get("id")?,
                record: CandidateRecord {
                    provider_id: decode_provider_id(row.try_get("provider_id")?)?,
                    entity_id: decode_entity_id(row.try_get("entity_id")?)?,
                    fields: serde_json::from_str(&raw_fields)?,
                    provenance_weight: row.try_get("provenance_weight")?,
                    fetched_at: decode_ts(&fetched_at)?,
                },
                clean_fields: clean_fields
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
            })
        })
        .collect()
}

/// Store the validated fields of one candidate.
///
/// # Errors
/// Returns error if serialisation or the write fails.
pub async fn set_clean_fields(
    pool: &Pool<Sqlite>,
    candidate_id: i64,
    clean_fields: &BTreeMap<String, String>,
) -> Result<()> {
    sqlx::query("UPDATE candidates SET clean_fields = ? WHERE id = ?")
        .bind(serde_json::to_string(clean_fields)?)
        .bind(candidate_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::enqueue_entity;
    use crate::Database;
    use chrono::{SubsecRound, Utc};
    use quarry_core::Entity;

    async fn setup() -> (Database, EntityId) {
        let db = Database::new(":memory:").await.expect("create test database");
        db.run_migrations().await.expect("run migrations");
        let entity_id = EntityId::new("acme").expect("valid id");
        enqueue_entity(db.pool(), &Entity::new(entity_id.clone(), "Acme"), Utc::now())
            .await
            .expect("enqueue");
        (db, entity_id)
    }

    fn record(provider: &str, entity_id: &EntityId, name: &str) -> CandidateRecord {
        CandidateRecord::new(
            ProviderId::new(provider).expect("valid id"),
            entity_id.clone(),
            0.7,
            Utc::now().trunc_subsecs(6),
        )
        .with_field("full_name", name)
        .with_field("title", "Director")
    }

    #[tokio::test]
    async fn test_replace_and_list() {
        let (db, entity_id) = setup().await;
        let directory = ProviderId::new("directory").expect("valid id");
        let first = record("directory", &entity_id, "Jane Doe");

        replace_candidates(db.pool(), &entity_id, &directory, &[first.clone()])
            .await
            .expect("store");

        let stored = list_candidates(db.pool(), &entity_id).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record, first);
        assert!(stored[0].clean_fields.is_none());
        assert!(stored[0].clean_record().is_none());
    }

    #[tokio::test]
    async fn test_replace_does_not_duplicate() {
        let (db, entity_id) = setup().await;
        let directory = ProviderId::new("directory").expect("valid id");
        let search = ProviderId::new("search").expect("valid id");

        replace_candidates(
            db.pool(),
            &entity_id,
            &search,
            &[record("search", &entity_id, "J. Doe")],
        )
        .await
        .expect("store search");

        for _ in 0..2 {
            replace_candidates(
                db.pool(),
                &entity_id,
                &directory,
                &[record("directory", &entity_id, "Jane Doe")],
            )
            .await
            .expect("store directory");
        }

        let stored = list_candidates(db.pool(), &entity_id).await.expect("list");
        let providers: Vec<&str> = stored
            .iter()
            .map(|c| c.record.provider_id.as_str())
            .collect();
        assert_eq!(providers, vec!["directory", "search"]);
    }

    #[tokio::test]
    async fn test_clean_fields() {
        let (db, entity_id) = setup().await;
        let directory = ProviderId::new("directory").expect("valid id");
        replace_candidates(
            db.pool(),
            &entity_id,
            &directory,
            &[record("directory", &entity_id, "Jane Doe").with_field("email", "not-an-email")],
        )
        .await
        .expect("store");

        let stored = list_candidates(db.pool(), &entity_id).await.expect("list");
        let mut clean = stored[0].record.fields.clone();
        clean.remove("email");
        set_clean_fields(db.pool(), stored[0].id, &clean)
            .await
            .expect("set clean");

        let stored = list_candidates(db.pool(), &entity_id).await.expect("list");
        let cleaned = stored[0].clean_record().expect("clean record");
        assert_eq!(cleaned.field("email"), None);
        assert_eq!(cleaned.field("full_name"), Some("Jane Doe"));
        assert_eq!(stored[0].record.field("email"), Some("not-an-email"));
    }
}
