//! Shared, last-writer-wins storage for progress records.

use anyhow::Result;
use parking_lot::RwLock;
use redis::Commands;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::ProgressRecord;

/// Key/value store polled by status readers. Implementations must tolerate
/// concurrent `get` and `put` without caller-side locking.
pub trait ProgressCache: Send + Sync {
    fn put(&self, key: &str, record: &ProgressRecord) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<ProgressRecord>>;
}

/// In-process cache with per-entry expiry.
pub struct MemoryProgressCache {
    entries: RwLock<HashMap<String, (ProgressRecord, Instant)>>,
    ttl: Duration,
}

impl MemoryProgressCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }
}

impl ProgressCache for MemoryProgressCache {
    fn put(&self, key: &str, record: &ProgressRecord) -> Result<()> {
        let expires = Instant::now() + self.ttl;
        self.entries
            .write()
            .insert(key.to_string(), (record.clone(), expires));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ProgressRecord>> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(record, _)| record.clone()))
    }
}

/// Redis-backed cache shared between server processes.
pub struct RedisProgressCache {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisProgressCache {
    pub fn new(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            ttl_secs,
        })
    }
}

impl ProgressCache for RedisProgressCache {
    fn put(&self, key: &str, record: &ProgressRecord) -> Result<()> {
        let mut conn = self.client.get_connection()?;
        let data = serde_json::to_string(record)?;
        let _: () = conn.set_ex(key, data, self.ttl_secs)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ProgressRecord>> {
        let mut conn = self.client.get_connection()?;
        let data: Option<String> = conn.get(key)?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_memory_cache_replaces_record() {
        let cache = MemoryProgressCache::new(Duration::from_secs(60));
        let mut record = ProgressRecord::new(Uuid::new_v4(), "cell", "box", 3);
        let key = record.cache_key();

        cache.put(&key, &record).unwrap();
        record.processed = 2;
        cache.put(&key, &record).unwrap();

        let stored = cache.get(&key).unwrap().unwrap();
        assert_eq!(stored.processed, 2);
        assert!(cache.get("box-missing").unwrap().is_none());
    }

    #[test]
    fn test_memory_cache_expires_entries() {
        let cache = MemoryProgressCache::new(Duration::from_millis(0));
        let record = ProgressRecord::new(Uuid::new_v4(), "cell", "box", 1);
        cache.put(&record.cache_key(), &record).unwrap();

        assert!(cache.get(&record.cache_key()).unwrap().is_none());
        assert_eq!(cache.purge_expired(), 1);
    }
}
