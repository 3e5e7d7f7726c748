use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;

/// Longest lifetime an entry can get, whatever TTL the caller asks for.
pub const MAX_ENTRY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One cached response and the provider that paid for it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub expires_at: Instant,
    pub provider: Arc<str>,
    pub estimated_cu: u64,
    pub hits: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Read-through response cache keyed by method and parameters.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns a live entry, dropping it instead if it has expired.
    pub fn get(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `value` until `now + ttl`, with `ttl` capped at [`MAX_ENTRY_TTL`].
    pub fn insert(
        &self,
        key: String,
        value: Value,
        ttl: Duration,
        provider: Arc<str>,
        estimated_cu: u64,
        now: Instant,
    ) {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: now.checked_add(ttl.min(MAX_ENTRY_TTL)).unwrap_or(now),
            provider,
            estimated_cu,
            hits: 0,
            created_at: Utc::now(),
        };

        let mut entries = self.entries.lock();
        entries.insert(key, entry);
        if entries.len() > self.max_size {
            let evicted = evict(&mut entries, self.max_size, now);
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            max_size: self.max_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Drops expired entries, then the soonest-expiring ones until at most `max_size` remain.
fn evict(entries: &mut HashMap<String, CacheEntry>, max_size: usize, now: Instant) -> u64 {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);

    if entries.len() > max_size {
        let mut by_expiry: Vec<(Instant, String)> =
            entries.iter().map(|(key, entry)| (entry.expires_at, key.clone())).collect();
        by_expiry.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let excess = entries.len() - max_size;
        for (_, key) in by_expiry.into_iter().take(excess) {
            entries.remove(&key);
        }
    }

    (before - entries.len()) as u64
}
