//! Live merged profile per entity.
//!
//! Profiles are stored as JSON and recomputed in place; the column type is
//! generic so this crate does not depend on the merge engine.

use crate::codec::encode_ts;
use crate::error::Result;
use chrono::{DateTime, Utc};
use quarry_core::EntityId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Pool, Sqlite};

/// Insert or replace the profile of an entity.
///
/// # Errors
/// Returns error if serialisation or the write fails.
pub async fn save_profile<P: Serialize + Sync>(
    pool: &Pool<Sqlite>,
    entity_id: &EntityId,
    profile: &P,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO profiles (entity_id, data, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(entity_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
    )
    .bind(entity_id.as_str())
    .bind(serde_json::to_string(profile)?)
    .bind(encode_ts(&now))
    .execute(pool)
    .await?;

    tracing::debug!(entity_id = %entity_id, "saved profile");
    Ok(())
}

/// Load the profile of an entity, if one was stored.
///
/// # Errors
/// Returns error if the query fails or the stored JSON does not decode as `P`.
pub async fn load_profile<P: DeserializeOwned>(
    pool: &Pool<Sqlite>,
    entity_id: &EntityId,
) -> Result<Option<P>> {
    let data: Option<String> = sqlx::query_scalar("SELECT data FROM profiles WHERE entity_id = ?")
        .bind(entity_id.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(data.map(|raw| serde_json::from_str(&raw)).transpose()?)
}

/// Raw stored JSON of a profile.
///
/// # Errors
/// Returns error if the query fails.
pub async fn load_profile_json(pool: &Pool<Sqlite>, entity_id: &EntityId) -> Result<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT data FROM profiles WHERE entity_id = ?")
            .bind(entity_id.as_str())
            .fetch_optional(pool)
            .await?,
    )
}
