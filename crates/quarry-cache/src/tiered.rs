//! Two-tier cache facade used by the fetch layer.

use crate::compression::StoredValue;
use crate::error::Result;
use crate::memory::MemoryTier;
use quarry_core::{CacheConfig, Clock, ProviderId};
use quarry_db::cache_entries::{self, CacheRow};
use quarry_db::Database;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from the in-process tier
    pub memory_hits: u64,
    /// Served from the persistent tier
    pub persistent_hits: u64,
    /// Not found (or failed) in either tier
    pub misses: u64,
    /// Values written
    pub writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// Provider result cache: sharded memory tier in front of `SQLite`.
///
/// Failures in either tier are logged and reported as misses; a broken
/// cache only ever costs extra provider calls.
pub struct ProviderCache {
    config: CacheConfig,
    memory: MemoryTier,
    persistent: Option<Database>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl ProviderCache {
    /// Build a cache from configuration.
    ///
    /// Without a database only the in-process tier is used.
    #[must_use]
    pub fn new(config: CacheConfig, persistent: Option<Database>, clock: Arc<dyn Clock>) -> Self {
        let memory = MemoryTier::new(config.shards, config.memory_max_entries, config.memory_ttl());
        Self {
            config,
            memory,
            persistent,
            clock,
            counters: Counters::default(),
        }
    }

    /// Whether caching is switched on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a value, memory tier first.
    ///
    /// A persistent-tier hit is copied into the memory tier.
    pub async fn get(&self, provider_id: &ProviderId, key: &str) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }

        match self.try_get(provider_id.as_str(), key).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(provider_id = %provider_id, key, error = %e, "cache read failed; treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value in both tiers.
    ///
    /// `ttl` applies to the persistent tier (default `persistent_ttl_secs`);
    /// the memory tier keeps the entry for at most `memory_ttl_secs`.
    pub async fn put(&self, provider_id: &ProviderId, key: &str, value: &[u8], ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        if let Err(e) = self.try_put(provider_id.as_str(), key, value, ttl).await {
            warn!(provider_id = %provider_id, key, error = %e, "cache write failed");
        } else {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a value from both tiers.
    pub async fn invalidate(&self, provider_id: &ProviderId, key: &str) {
        self.memory.remove(provider_id.as_str(), key);
        if let Some(db) = &self.persistent {
            if let Err(e) = cache_entries::delete_cache_entry(db.pool(), provider_id.as_str(), key).await {
                warn!(provider_id = %provider_id, key, error = %e, "cache invalidation failed");
            }
        }
    }

    /// Remove expired entries from both tiers.
    ///
    /// Returns the number of persistent rows removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let memory_removed = self.memory.purge_expired();
        let persistent_removed = match &self.persistent {
            Some(db) => cache_entries::purge_expired(db.pool(), self.clock.now()).await?,
            None => 0,
        };
        debug!(memory_removed, persistent_removed, "purged expired cache entries");
        Ok(persistent_removed)
    }

    /// Snapshot of the hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.counters.persistent_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    async fn try_get(&self, provider_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(stored) = self.memory.get(provider_id, key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return stored.decode().map(Some);
        }

        let Some(db) = &self.persistent else {
            return Ok(None);
        };

        let now = self.clock.now();
        let Some(row) = cache_entries::get_cache_entry(db.pool(), provider_id, key, now).await? else {
            return Ok(None);
        };

        let stored = StoredValue {
            bytes: row.value,
            compressed: row.compressed,
        };
        let value = stored.decode()?;
        self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);

        let remaining = (row.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        self.memory.put(provider_id, key, stored, Some(remaining));

        Ok(Some(value))
    }

    async fn try_put(&self, provider_id: &str, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or_else(|| self.config.persistent_ttl());
        let stored = StoredValue::encode(value, self.config.compress_threshold_bytes)?;

        self.memory.put(provider_id, key, stored.clone(), Some(ttl));

        if let Some(db) = &self.persistent {
            let now = self.clock.now();
            let expires_at = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
            let row = CacheRow {
                value: stored.bytes,
                compressed: stored.compressed,
                expires_at,
            };
            cache_entries::put_cache_entry(db.pool(), provider_id, key, &row, now).await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for ProviderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCache")
            .field("config", &self.config)
            .field("persistent", &self.persistent.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
