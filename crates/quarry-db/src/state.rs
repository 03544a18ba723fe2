//! Processing state persistence and entity leases.
//!
//! The scheduler is the only writer of `processing_state`. Writes go through
//! an upsert guarded by `stage_rank`, so a stale writer can never move an
//! entity backwards even if two processes race on the same row.

use crate::codec::{decode_entity_id, decode_opt_ts, decode_ts, encode_ts, latest_ts, to_u32, to_u64};
use crate::error::{DatabaseError, Result};
use crate::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::{EntityId, ProcessingState, Stage, StageError};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;

/// Durable per-entity state with exclusive, time-bounded claims.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state of one entity.
    async fn load(&self, entity_id: &EntityId) -> Result<Option<ProcessingState>>;

    /// Atomically upsert a state.
    ///
    /// Fails with `DatabaseError::StaleWrite` if the stored stage is further
    /// along than `state.stage` or already terminal.
    async fn save(&self, state: &ProcessingState) -> Result<()>;

    /// Take the lease on an entity until `now + lease`.
    ///
    /// Succeeds if the entity is unleased, its lease expired, or `owner`
    /// already holds it.
    async fn claim(
        &self,
        entity_id: &EntityId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool>;

    /// Drop a lease held by `owner`.
    async fn release(&self, entity_id: &EntityId, owner: &str) -> Result<()>;

    /// Non-terminal, unleased entities whose retry time has passed.
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ProcessingState>>;

    /// Earliest time any non-terminal entity becomes claimable.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
impl StateStore for Database {
    async fn load(&self, entity_id: &EntityId) -> Result<Option<ProcessingState>> {
        let row = sqlx::query(
            "SELECT entity_id, stage, attempt_count, last_error, next_retry_at, updated_at
             FROM processing_state WHERE entity_id = ?",
        )
        .bind(entity_id.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(decode_state).transpose()
    }

    async fn save(&self, state: &ProcessingState) -> Result<()> {
        let last_error = state
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "INSERT INTO processing_state
                 (entity_id, stage, stage_rank, attempt_count, last_error, next_retry_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_id) DO UPDATE SET
                 stage = excluded.stage,
                 stage_rank = excluded.stage_rank,
                 attempt_count = excluded.attempt_count,
                 last_error = excluded.last_error,
                 next_retry_at = excluded.next_retry_at,
                 updated_at = excluded.updated_at
             WHERE excluded.stage = processing_state.stage
                OR (processing_state.stage NOT IN ('DONE', 'FAILED')
                    AND excluded.stage_rank >= processing_state.stage_rank)",
        )
        .bind(state.entity_id.as_str())
        .bind(state.stage.as_str())
        .bind(state.stage.rank())
        .bind(i64::from(state.attempt_count))
        .bind(last_error)
        .bind(state.next_retry_at.as_ref().map(encode_ts))
        .bind(encode_ts(&state.updated_at))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::StaleWrite {
                entity_id: state.entity_id.to_string(),
                stage: state.stage.to_string(),
            });
        }

        tracing::debug!(
            entity_id = %state.entity_id,
            stage = %state.stage,
            attempt_count = state.attempt_count,
            "saved processing state"
        );
        Ok(())
    }

    async fn claim(
        &self,
        entity_id: &EntityId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let latest = latest_ts();
        let expires_at = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .filter(|at| *at < latest)
            .unwrap_or(latest);
        let now = encode_ts(&now);

        let result = sqlx::query(
            "UPDATE processing_state SET lease_owner = ?, lease_expires_at = ?
             WHERE entity_id = ?
               AND (lease_owner IS NULL OR lease_owner = ? OR lease_expires_at <= ?)",
        )
        .bind(owner)
        .bind(encode_ts(&expires_at))
        .bind(entity_id.as_str())
        .bind(owner)
        .bind(&now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, entity_id: &EntityId, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE processing_state SET lease_owner = NULL, lease_expires_at = NULL
             WHERE entity_id = ? AND lease_owner = ?",
        )
        .bind(entity_id.as_str())
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ProcessingState>> {
        let now = encode_ts(&now);
        let rows = sqlx::query(
            "SELECT entity_id, stage, attempt_count, last_error, next_retry_at, updated_at
             FROM processing_state
             WHERE stage NOT IN ('DONE', 'FAILED')
               AND (next_retry_at IS NULL OR next_retry_at <= ?)
               AND (lease_owner IS NULL OR lease_expires_at <= ?)
             ORDER BY COALESCE(next_retry_at, updated_at), entity_id
             LIMIT ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(decode_state).collect()
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<String> = sqlx::query_scalar(
            "SELECT MIN(MAX(COALESCE(next_retry_at, updated_at), COALESCE(lease_expires_at, updated_at)))
             FROM processing_state
             WHERE stage NOT IN ('DONE', 'FAILED')",
        )
        .fetch_one(self.pool())
        .await?;

        decode_opt_ts(next.as_deref())
    }
}

/// Every entity's state, in id order.
///
/// # Errors
/// Returns error if the query fails or a row cannot be decoded.
pub async fn list_states(pool: &Pool<Sqlite>) -> Result<Vec<ProcessingState>> {
    let rows = sqlx::query(
        "SELECT entity_id, stage, attempt_count, last_error, next_retry_at, updated_at
         FROM processing_state ORDER BY entity_id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_state).collect()
}

/// Entity count per stage, in pipeline order, omitting empty stages.
///
/// # Errors
/// Returns error if the query fails or a stored stage is unknown.
pub async fn count_by_stage(pool: &Pool<Sqlite>) -> Result<Vec<(Stage, u64)>> {
    let rows = sqlx::query(
        "SELECT stage, COUNT(*) AS n FROM processing_state GROUP BY stage, stage_rank ORDER BY stage_rank",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<(Stage, u64)> {
            let stage: String = row.try_get("stage")?;
            let stage = stage
                .parse::<Stage>()
                .map_err(|e| DatabaseError::Decode(e.to_string()))?;
            Ok((stage, to_u64(row.try_get("n")?)))
        })
        .collect()
}

/// Number of entities that have not reached a terminal stage.
///
/// # Errors
/// Returns error if the query fails.
pub async fn count_active(pool: &Pool<Sqlite>) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing_state WHERE stage NOT IN ('DONE', 'FAILED')",
    )
    .fetch_one(pool)
    .await?;
    Ok(to_u64(n))
}

fn decode_state(row: &SqliteRow) -> Result<ProcessingState> {
    let stage: String = row.try_get("stage")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ProcessingState {
        entity_id: decode_entity_id(row.try_get("entity_id")?)?,
        stage: stage
            .parse::<Stage>()
            .map_err(|e| DatabaseError::Decode(e.to_string()))?,
        attempt_count: to_u32(row.try_get("attempt_count")?),
        last_error: last_error
            .map(|raw| serde_json::from_str::<StageError>(&raw))
            .transpose()?,
        next_retry_at: decode_opt_ts(next_retry_at.as_deref())?,
        updated_at: decode_ts(&updated_at)?,
    })
}
