//! Scheduler run bookkeeping.

use crate::codec::{decode_opt_ts, decode_ts, encode_ts, to_i64, to_u64};
use crate::error::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    /// Scheduler loop is active
    Running,
    /// Every entity reached a terminal stage
    Completed,
    /// Shutdown was requested before completion
    Cancelled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(DatabaseError::Decode(format!("unknown batch status '{other}'"))),
        }
    }
}

/// One scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    /// Run id (UUID v4)
    pub id: String,
    /// When the loop started
    pub started_at: DateTime<Utc>,
    /// When the loop stopped
    pub finished_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: BatchStatus,
    /// Stage transitions processed
    pub transitions: u64,
    /// Independent provider retries processed
    pub provider_retries: u64,
    /// Entities that reached `DONE` during the run
    pub entities_done: u64,
    /// Entities that reached `FAILED` during the run
    pub entities_failed: u64,
}

/// Open a new `Running` batch run.
///
/// # Errors
/// Returns error if the insert fails.
pub async fn start_batch_run(pool: &Pool<Sqlite>, now: DateTime<Utc>) -> Result<BatchRun> {
    let run = BatchRun {
        id: Uuid::new_v4().to_string(),
        started_at: now,
        finished_at: None,
        status: BatchStatus::Running,
        transitions: 0,
        provider_retries: 0,
        entities_done: 0,
        entities_failed: 0,
    };

    sqlx::query("INSERT INTO batch_runs (id, started_at, status) VALUES (?, ?, ?)")
        .bind(&run.id)
        .bind(encode_ts(&run.started_at))
        .bind(run.status.to_string())
        .execute(pool)
        .await?;

    tracing::info!(run_id = %run.id, "batch run started");
    Ok(run)
}

/// Persist a run's counters, status and finish time.
///
/// # Errors
/// Returns `DatabaseError::NotFound` if the run does not exist.
pub async fn update_batch_run(pool: &Pool<Sqlite>, run: &BatchRun) -> Result<()> {
    let result = sqlx::query(
        "UPDATE batch_runs
         SET finished_at = ?, status = ?, transitions = ?, provider_retries = ?,
             entities_done = ?, entities_failed = ?
         WHERE id = ?",
    )
    .bind(run.finished_at.as_ref().map(encode_ts))
    .bind(run.status.to_string())
    .bind(to_i64(run.transitions))
    .bind(to_i64(run.provider_retries))
    .bind(to_i64(run.entities_done))
    .bind(to_i64(run.entities_failed))
    .bind(&run.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound(format!(
            "Batch run '{}' not found",
            run.id
        )));
    }
    Ok(())
}

/// Load a run by id.
///
/// # Errors
/// Returns error if the query fails or the row cannot be decoded.
pub async fn get_batch_run(pool: &Pool<Sqlite>, id: &str) -> Result<Option<BatchRun>> {
    let row = sqlx::query(
        "SELECT id, started_at, finished_at, status, transitions, provider_retries,
                entities_done, entities_failed
         FROM batch_runs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| -> Result<BatchRun> {
        let started_at: String = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        let status: String = row.try_get("status")?;
        Ok(BatchRun {
            id: row.try_get("id")?,
            started_at: decode_ts(&started_at)?,
            finished_at: decode_opt_ts(finished_at.as_deref())?,
            status: status.parse::<BatchStatus>()?,
            transitions: to_u64(row.try_get("transitions")?),
            provider_retries: to_u64(row.try_get("provider_retries")?),
            entities_done: to_u64(row.try_get("entities_done")?),
            entities_failed: to_u64(row.try_get("entities_failed")?),
        })
    })
    .transpose()
}
