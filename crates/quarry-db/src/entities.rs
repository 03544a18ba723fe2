//! Entity rows and their initial processing state.

use crate::codec::{decode_entity_id, encode_ts};
use crate::error::Result;
use chrono::{DateTime, Utc};
use quarry_core::{Entity, EntityId, Stage};
use sqlx::{Pool, Row, Sqlite};

/// Insert an entity and its `PENDING` state row.
///
/// Enqueueing an entity that already exists is a no-op and leaves its
/// progress untouched. Returns whether a new row was created.
///
/// # Errors
/// Returns error if the database write fails.
pub async fn enqueue_entity(pool: &Pool<Sqlite>, entity: &Entity, now: DateTime<Utc>) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let now = encode_ts(&now);

    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO entities (entity_id, name, website, locale, sector, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entity.entity_id.as_str())
    .bind(&entity.name)
    .bind(&entity.website)
    .bind(&entity.locale)
    .bind(&entity.sector)
    .bind(&now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        sqlx::query(
            "INSERT INTO processing_state (entity_id, stage, stage_rank, attempt_count, updated_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(entity.entity_id.as_str())
        .bind(Stage::Pending.as_str())
        .bind(Stage::Pending.rank())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    if inserted {
        tracing::debug!(entity_id = %entity.entity_id, "enqueued entity");
    }
    Ok(inserted)
}

/// Load an entity by id.
///
/// # Errors
/// Returns error if the query fails or a stored id is malformed.
pub async fn get_entity(pool: &Pool<Sqlite>, entity_id: &EntityId) -> Result<Option<Entity>> {
    let row = sqlx::query(
        "SELECT entity_id, name, website, locale, sector FROM entities WHERE entity_id = ?",
    )
    .bind(entity_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(|row| -> Result<Entity> {
        Ok(Entity {
            entity_id: decode_entity_id(row.try_get("entity_id")?)?,
            name: row.try_get("name")?,
            website: row.try_get("website")?,
            locale: row.try_get("locale")?,
            sector: row.try_get("sector")?,
        })
    })
    .transpose()
}

/// All entity ids in id order.
///
/// # Errors
/// Returns error if the query fails or a stored id is malformed.
pub async fn list_entity_ids(pool: &Pool<Sqlite>) -> Result<Vec<EntityId>> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT entity_id FROM entities ORDER BY entity_id")
        .fetch_all(pool)
        .await?;

    ids.into_iter().map(decode_entity_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    async fn setup_test_db() -> Database {
        let db = Database::new(":memory:").await.expect("create test database");
        db.run_migrations().await.expect("run migrations");
        db
    }

    fn entity(id: &str) -> Entity {
        Entity::new(EntityId::new(id).expect("valid id"), "Acme GmbH")
            .with_website("acme.example")
            .with_locale("de")
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let db = setup_test_db().await;
        let acme = entity("acme");

        assert!(enqueue_entity(db.pool(), &acme, Utc::now()).await.expect("enqueue"));

        let loaded = get_entity(db.pool(), &acme.entity_id)
            .await
            .expect("get entity")
            .expect("entity exists");
        assert_eq!(loaded, acme);

        let stage: String =
            sqlx::query_scalar("SELECT stage FROM processing_state WHERE entity_id = 'acme'")
                .fetch_one(db.pool())
                .await
                .expect("query stage");
        assert_eq!(stage, "PENDING");
    }

    #[tokio::test]
    async fn test_enqueue_twice_is_noop() {
        let db = setup_test_db().await;
        let acme = entity("acme");
        enqueue_entity(db.pool(), &acme, Utc::now()).await.expect("enqueue");

        sqlx::query("UPDATE processing_state SET stage = 'MERGING', stage_rank = 3")
            .execute(db.pool())
            .await
            .expect("advance");

        assert!(!enqueue_entity(db.pool(), &acme, Utc::now()).await.expect("enqueue again"));

        let stage: String = sqlx::query_scalar("SELECT stage FROM processing_state")
            .fetch_one(db.pool())
            .await
            .expect("query stage");
        assert_eq!(stage, "MERGING");
    }

    #[tokio::test]
    async fn test_list_entity_ids_sorted() {
        let db = setup_test_db().await;
        for id in ["zeta", "alpha", "mid"] {
            enqueue_entity(db.pool(), &entity(id), Utc::now()).await.expect("enqueue");
        }

        let ids = list_entity_ids(db.pool()).await.expect("list");
        let ids: Vec<&str> = ids.iter().map(EntityId::as_str).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_get_missing_entity() {
        let db = setup_test_db().await;
        let missing = get_entity(db.pool(), &EntityId::new("nope").expect("valid id"))
            .await
            .expect("query");
        assert!(missing.is_none());
    }
}
