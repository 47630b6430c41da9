//! In-process TTL cache for entity snapshots.
//!
//! Sits in front of the Redis read-through cache so hot reads never leave
//! the process. Entries are JSON snapshots keyed by entity type and id.

use crate::types::EntityType;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct CacheEntry {
    json: String,
    expires_at: Instant,
}

/// Thread-safe entity snapshot cache with TTL and hit/miss counters.
pub struct EntityCache {
    data: DashMap<(EntityType, Uuid), CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EntityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, entity_type: EntityType, id: Uuid) -> Option<String> {
        let key = (entity_type, id);
        if let Some(entry) = self.data.get(&key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.json.clone());
            }
            drop(entry);
            self.data.remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, entity_type: EntityType, id: Uuid, json: String) {
        self.data.insert(
            (entity_type, id),
            CacheEntry {
                json,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, entity_type: EntityType, id: Uuid) {
        self.data.remove(&(entity_type, id));
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.data.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// (hits, misses) since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
