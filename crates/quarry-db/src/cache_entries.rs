//! Rows of the persistent cache tier.

use crate::codec::{decode_ts, encode_ts};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

/// A stored cache value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    /// Stored bytes, compressed when `compressed` is set
    pub value: Vec<u8>,
    /// Whether `value` is deflate-compressed
    pub compressed: bool,
    /// When the entry stops being served
    pub expires_at: DateTime<Utc>,
}

/// Fetch an unexpired entry.
///
/// # Errors
/// Returns error if the query fails or the row cannot be decoded.
pub async fn get_cache_entry(
    pool: &Pool<Sqlite>,
    provider_id: &str,
    entity_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<CacheRow>> {
    let row = sqlx::query(
        "SELECT value, compressed, expires_at FROM cache_entries
         WHERE provider_id = ? AND entity_key = ? AND expires_at > ?",
    )
    .bind(provider_id)
    .bind(entity_key)
    .bind(encode_ts(&now))
    .fetch_optional(pool)
    .await?;

    row.map(|row| -> Result<CacheRow> {
        let expires_at: String = row.try_get("expires_at")?;
        Ok(CacheRow {
            value: row.try_get("value")?,
            compressed: row.try_get("compressed")?,
            expires_at: decode_ts(&expires_at)?,
        })
    })
    .transpose()
}

/// Insert or overwrite an entry.
///
/// # Errors
/// Returns error if the write fails.
pub async fn put_cache_entry(
    pool: &Pool<Sqlite>,
    provider_id: &str,
    entity_key: &str,
    row: &CacheRow,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cache_entries (provider_id, entity_key, value, compressed, expires_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(provider_id, entity_key) DO UPDATE SET
             value = excluded.value,
             compressed = excluded.compressed,
             expires_at = excluded.expires_at,
             created_at = excluded.created_at",
    )
    .bind(provider_id)
    .bind(entity_key)
    .bind(&row.value)
    .bind(row.compressed)
    .bind(encode_ts(&row.expires_at))
    .bind(encode_ts(&now))
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove one entry.
///
/// # Errors
/// Returns error if the delete fails.
pub async fn delete_cache_entry(pool: &Pool<Sqlite>, provider_id: &str, entity_key: &str) -> Result<()> {
    sqlx::query("DELETE FROM cache_entries WHERE provider_id = ? AND entity_key = ?")
        .bind(provider_id)
        .bind(entity_key)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove every entry that expired at or before `now`.
///
/// # Errors
/// Returns error if the delete fails.
pub async fn purge_expired(pool: &Pool<Sqlite>, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
        .bind(encode_ts(&now))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
