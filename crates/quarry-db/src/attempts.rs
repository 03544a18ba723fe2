//! Per-provider fetch attempts.
//!
//! Each `(entity, provider)` pair has one row. The row outlives the
//! entity's `DISCOVERING` stage so a provider that failed transiently can be
//! retried on its own schedule after the entity has moved on.

use crate::codec::{decode_entity_id, decode_opt_ts, decode_provider_id, decode_ts, encode_ts, to_u32, to_u64};
use crate::error::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use quarry_core::{EntityId, ProviderId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::fmt;
use std::str::FromStr;

/// Status of one provider for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Selected for the entity, not fetched yet
    Planned,
    /// Returned candidates
    Succeeded,
    /// Answered with nothing
    Empty,
    /// Failed transiently; waiting for `next_retry_at`
    RetryPending,
    /// Failed permanently or exhausted its retries
    Failed,
}

impl AttemptStatus {
    /// Stored name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Succeeded => "succeeded",
            Self::Empty => "empty",
            Self::RetryPending => "retry_pending",
            Self::Failed => "failed",
        }
    }

    /// Whether no further fetch is expected.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Empty | Self::Failed)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(Self::Planned),
            "succeeded" => Ok(Self::Succeeded),
            "empty" => Ok(Self::Empty),
            "retry_pending" => Ok(Self::RetryPending),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Decode(format!("unknown attempt status '{other}'"))),
        }
    }
}

/// Recorded state of fetching one provider for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    /// Entity being enriched
    pub entity_id: EntityId,
    /// Provider asked
    pub provider_id: ProviderId,
    /// Current status
    pub status: AttemptStatus,
    /// Fetches made so far
    pub attempt_count: u32,
    /// Description of the most recent outcome
    pub last_outcome: Option<String>,
    /// When a `RetryPending` attempt may run again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl ProviderAttempt {
    /// A fresh `Planned` attempt.
    #[must_use]
    pub fn planned(entity_id: EntityId, provider_id: ProviderId, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            provider_id,
            status: AttemptStatus::Planned,
            attempt_count: 0,
            last_outcome: None,
            next_retry_at: None,
            updated_at: now,
        }
    }
}

/// Record the provider plan for an entity.
///
/// Providers already planned keep their existing row.
///
/// # Errors
/// Returns error if any insert fails.
pub async fn plan_attempts(
    pool: &Pool<Sqlite>,
    entity_id: &EntityId,
    providers: &[ProviderId],
    now: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let now = encode_ts(&now);

    for provider_id in providers {
        sqlx::query(
            "INSERT OR IGNORE INTO provider_attempts (entity_id, provider_id, status, attempt_count, updated_at)
             VALUES (?, ?, 'planned', 0, ?)",
        )
        .bind(entity_id.as_str())
        .bind(provider_id.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Upsert an attempt row.
///
/// # Errors
/// Returns error if the write fails.
pub async fn save_attempt(pool: &Pool<Sqlite>, attempt: &ProviderAttempt) -> Result<()> {
    sqlx::query(
        "INSERT INTO provider_attempts
             (entity_id, provider_id, status, attempt_count, last_outcome, next_retry_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(entity_id, provider_id) DO UPDATE SET
             status = excluded.status,
             attempt_count = excluded.attempt_count,
             last_outcome = excluded.last_outcome,
             next_retry_at = excluded.next_retry_at,
             updated_at = excluded.updated_at",
    )
    .bind(attempt.entity_id.as_str())
    .bind(attempt.provider_id.as_str())
    .bind(attempt.status.as_str())
    .bind(i64::from(attempt.attempt_count))
    .bind(&attempt.last_outcome)
    .bind(attempt.next_retry_at.as_ref().map(encode_ts))
    .bind(encode_ts(&attempt.updated_at))
    .execute(pool)
    .await?;
    Ok(())
}

/// All attempts for an entity, in provider-id order.
///
/// # Errors
/// Returns error if the query fails or a row cannot be decoded.
pub async fn list_attempts(pool: &Pool<Sqlite>, entity_id: &EntityId) -> Result<Vec<ProviderAttempt>> {
    let rows = sqlx::query(
        "SELECT entity_id, provider_id, status, attempt_count, last_outcome, next_retry_at, updated_at
         FROM provider_attempts WHERE entity_id = ? ORDER BY provider_id",
    )
    .bind(entity_id.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_attempt).collect()
}

/// `RetryPending` attempts whose retry time has passed, oldest first.
///
/// Only entities past `DISCOVERING` are considered: while an entity is
/// still discovering, its stage retry refetches unsettled providers itself.
/// Attempts of `FAILED` entities are excluded.
///
/// # Errors
/// Returns error if the query fails or a row cannot be decoded.
pub async fn due_retries(
    pool: &Pool<Sqlite>,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<ProviderAttempt>> {
    let rows = sqlx::query(
        "SELECT a.entity_id, a.provider_id, a.status, a.attempt_count, a.last_outcome,
                a.next_retry_at, a.updated_at
         FROM provider_attempts a
         JOIN processing_state s ON s.entity_id = a.entity_id
         WHERE a.status = 'retry_pending'
           AND s.stage NOT IN ('PENDING', 'DISCOVERING', 'FAILED')
           AND (a.next_retry_at IS NULL OR a.next_retry_at <= ?)
         ORDER BY a.next_retry_at, a.entity_id, a.provider_id
         LIMIT ?",
    )
    .bind(encode_ts(&now))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_attempt).collect()
}

/// Earliest pending provider retry, if any.
///
/// # Errors
/// Returns error if the query fails.
pub async fn next_retry_at(pool: &Pool<Sqlite>) -> Result<Option<DateTime<Utc>>> {
    let next: Option<String> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(a.next_retry_at, a.updated_at))
         FROM provider_attempts a
         JOIN processing_state s ON s.entity_id = a.entity_id
         WHERE a.status = 'retry_pending' AND s.stage NOT IN ('PENDING', 'DISCOVERING', 'FAILED')",
    )
    .fetch_one(pool)
    .await?;

    decode_opt_ts(next.as_deref())
}

/// Number of provider retries still outstanding.
///
/// # Errors
/// Returns error if the query fails.
pub async fn count_pending_retries(pool: &Pool<Sqlite>) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)
         FROM provider_attempts a
         JOIN processing_state s ON s.entity_id = a.entity_id
         WHERE a.status = 'retry_pending' AND s.stage NOT IN ('PENDING', 'DISCOVERING', 'FAILED')",
    )
    .fetch_one(pool)
    .await?;
    Ok(to_u64(n))
}

/// Mark every unsettled attempt of an entity as failed.
///
/// Used when the entity itself is terminalised.
///
/// # Errors
/// Returns error if the update fails.
pub async fn abandon_unsettled(
    pool: &Pool<Sqlite>,
    entity_id: &EntityId,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE provider_attempts
         SET status = 'failed', last_outcome = ?, next_retry_at = NULL, updated_at = ?
         WHERE entity_id = ? AND status IN ('planned', 'retry_pending')",
    )
    .bind(reason)
    .bind(encode_ts(&now))
    .bind(entity_id.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

fn decode_attempt(row: &SqliteRow) -> Result<ProviderAttempt> {
    let status: String = row.try_get("status")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ProviderAttempt {
        entity_id: decode_entity_id(row.try_get("entity_id")?)?,
        provider_id: decode_provider_id(row.try_get("provider_id")?)?,
        status: status.parse::<AttemptStatus>()?,
        attempt_count: to_u32(row.try_get("attempt_count")?),
        last_outcome: row.try_get("last_outcome")?,
        next_retry_at: decode_opt_ts(next_retry_at.as_deref())?,
        updated_at: decode_ts(&updated_at)?,
    })
}
