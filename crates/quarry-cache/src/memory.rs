//! In-process cache tier.
//!
//! Entries are spread over independently locked shards by key hash, so
//! concurrent lookups for different providers rarely contend. Each shard
//! holds at most `max_entries / shards` entries; when full it drops expired
//! entries first, then the entry closest to expiry.

use crate::compression::StoredValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider_id: String,
    entity_key: String,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: StoredValue,
    expires_at: Instant,
}

/// Sharded TTL map.
#[derive(Debug)]
pub struct MemoryTier {
    shards: Vec<Mutex<HashMap<CacheKey, MemoryEntry>>>,
    per_shard_capacity: usize,
    ttl: Duration,
}

impl MemoryTier {
    /// Create a tier with `shards` shards sharing `max_entries` slots.
    #[must_use]
    pub fn new(shards: usize, max_entries: usize, ttl: Duration) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            per_shard_capacity: max_entries.div_ceil(shards).max(1),
            ttl,
        }
    }

    /// Look up an unexpired entry.
    #[must_use]
    pub fn get(&self, provider_id: &str, entity_key: &str) -> Option<StoredValue> {
        let key = CacheKey {
            provider_id: provider_id.to_string(),
            entity_key: entity_key.to_string(),
        };
        let mut shard = self.shard(&key).lock().expect("acquire cache shard lock");

        match shard.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                shard.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Insert an entry living for the tier TTL, or `ttl` if shorter.
    pub fn put(&self, provider_id: &str, entity_key: &str, value: StoredValue, ttl: Option<Duration>) {
        let key = CacheKey {
            provider_id: provider_id.to_string(),
            entity_key: entity_key.to_string(),
        };
        let ttl = ttl.map_or(self.ttl, |ttl| ttl.min(self.ttl));
        let now = Instant::now();

        let mut shard = self.shard(&key).lock().expect("acquire cache shard lock");

        if !shard.contains_key(&key) && shard.len() >= self.per_shard_capacity {
            shard.retain(|_, entry| entry.expires_at > now);
            if shard.len() >= self.per_shard_capacity {
                let victim = shard
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(victim) = victim {
                    shard.remove(&victim);
                }
            }
        }

        shard.insert(
            key,
            MemoryEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop one entry.
    pub fn remove(&self, provider_id: &str, entity_key: &str) {
        let key = CacheKey {
            provider_id: provider_id.to_string(),
            entity_key: entity_key.to_string(),
        };
        self.shard(&key)
            .lock()
            .expect("acquire cache shard lock")
            .remove(&key);
    }

    /// Drop expired entries from every shard; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock().expect("acquire cache shard lock");
                let before = shard.len();
                shard.retain(|_, entry| entry.expires_at > now);
                before - shard.len()
            })
            .sum()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("acquire cache shard lock").len())
            .sum()
    }

    /// Whether the tier holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<HashMap<CacheKey, MemoryEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(bytes: &[u8]) -> StoredValue {
        StoredValue {
            bytes: bytes.to_vec(),
            compressed: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_put_and_expiry() {
        let tier = MemoryTier::new(4, 100, Duration::from_secs(60));
        tier.put("directory", "acme", value(b"v1"), None);

        assert_eq!(tier.get("directory", "acme"), Some(value(b"v1")));
        assert_eq!(tier.get("search", "acme"), None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tier.get("directory", "acme"), None);
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_ttl_wins() {
        let tier = MemoryTier::new(1, 10, Duration::from_secs(600));
        tier.put("directory", "acme", value(b"v"), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tier.get("directory", "acme"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_expired_then_soonest() {
        let tier = MemoryTier::new(1, 2, Duration::from_secs(600));
        tier.put("p", "short", value(b"1"), Some(Duration::from_secs(10)));
        tier.put("p", "long", value(b"2"), None);

        tokio::time::advance(Duration::from_secs(1)).await;
        tier.put("p", "third", value(b"3"), None);
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("p", "short"), None);
        assert!(tier.get("p", "long").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        tier.put("p", "fourth", value(b"4"), None);
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("p", "long"), None);
        assert!(tier.get("p", "third").is_some());
        assert!(tier.get("p", "fourth").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let tier = MemoryTier::new(1, 1, Duration::from_secs(60));
        tier.put("p", "k", value(b"1"), None);
        tier.put("p", "k", value(b"2"), None);
        assert_eq!(tier.get("p", "k"), Some(value(b"2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_remove() {
        let tier = MemoryTier::new(8, 100, Duration::from_secs(60));
        for key in ["a", "b", "c"] {
            tier.put("p", key, value(b"x"), None);
        }
        tier.put("p", "fresh", value(b"x"), None);
        tier.remove("p", "c");

        tokio::time::advance(Duration::from_secs(30)).await;
        tier.put("p", "late", value(b"x"), None);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(tier.purge_expired(), 3);
        assert_eq!(tier.len(), 1);
    }
}
