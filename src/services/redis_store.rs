//! Redis client for the event mirror, per-entity advisory locks and the
//! read-through entity cache.
//!
//! The durable relational record is always the source of truth; everything
//! here is acceleration. A missing or failed Redis connection degrades
//! latency, never correctness, so every operation is best-effort and the
//! store runs happily with no connection at all.

use crate::types::SyncEvent;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redis::{aio::ConnectionManager, RedisResult};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Redis key prefixes and TTLs.
const EVENT_PREFIX: &str = "sync:event:";
const LOCK_PREFIX: &str = "sync:lock:";
const CACHE_PREFIX: &str = "sync:cache:";
const EVENT_TTL_SECS: u64 = 86_400;
const LOCK_TTL_SECS: u64 = 60;
const CACHE_TTL_SECS: u64 = 300;

/// Payloads above this size are gzip-compressed before mirroring.
const COMPRESS_THRESHOLD: usize = 10_240;

/// Redis-backed mirror for low-latency event dispatch and entity reads.
#[derive(Clone)]
pub struct RedisStore {
    conn: Arc<RwLock<Option<ConnectionManager>>>,
}

impl RedisStore {
    /// Connect to Redis at the given URL, or run degraded without it.
    pub async fn new(redis_url: &str) -> Self {
        let conn = match Self::connect(redis_url).await {
            Ok(c) => {
                info!("Connected to Redis at {}", redis_url);
                Some(c)
            }
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Running without the event mirror.",
                    e
                );
                None
            }
        };

        Self {
            conn: Arc::new(RwLock::new(conn)),
        }
    }

    /// A store with no connection, for tests and cache-less deployments.
    pub fn disconnected() -> Self {
        Self {
            conn: Arc::new(RwLock::new(None)),
        }
    }

    async fn connect(redis_url: &str) -> RedisResult<ConnectionManager> {
        let client = redis::Client::open(redis_url)?;
        ConnectionManager::new(client).await
    }

    /// Check if Redis is connected.
    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    /// PING round-trip latency in milliseconds, if connected.
    pub async fn ping_ms(&self) -> Option<Result<i64, String>> {
        let conn_guard = self.conn.read().await;
        let conn = conn_guard.as_ref()?;
        let mut conn = conn.clone();
        let start = Instant::now();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        Some(
            result
                .map(|_| start.elapsed().as_millis() as i64)
                .map_err(|e| e.to_string()),
        )
    }

    // ========== Event mirror ==========

    /// Mirror an event for hot-path dispatch. Oversized payloads are
    /// gzip-compressed; readers detect the gzip magic bytes.
    pub async fn mirror_event(&self, event: &SyncEvent) {
        let conn_guard = self.conn.read().await;
        let Some(ref conn) = *conn_guard else {
            return;
        };

        let json = match serde_json::to_vec(event) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize event {} for mirror: {}", event.id, e);
                return;
            }
        };
        let bytes = if json.len() > COMPRESS_THRESHOLD {
            match compress_gzip(&json) {
                Ok(c) => c,
                Err(e) => {
                    debug!("Compression failed for event {}: {}", event.id, e);
                    json
                }
            }
        } else {
            json
        };

        let key = format!("{}{}", EVENT_PREFIX, event.id);
        let mut conn = conn.clone();
        if let Err(e) = redis::cmd("SET")
            .arg(&key)
            .arg(bytes)
            .arg("EX")
            .arg(EVENT_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            error!("Failed to mirror event {}: {}", event.id, e);
        }
    }

    /// Fetch a mirrored event, transparently decompressing.
    pub async fn get_mirrored_event(&self, event_id: Uuid) -> Option<SyncEvent> {
        let conn_guard = self.conn.read().await;
        let conn = conn_guard.as_ref()?;

        let key = format!("{}{}", EVENT_PREFIX, event_id);
        let mut conn = conn.clone();
        let bytes: RedisResult<Option<Vec<u8>>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;

        let bytes = match bytes {
            Ok(Some(b)) => b,
            _ => return None,
        };
        let json = if bytes.starts_with(&[0x1f, 0x8b]) {
            decompress_gzip(&bytes).ok()?
        } else {
            bytes
        };
        serde_json::from_slice(&json).ok()
    }

    /// Drop a mirrored event after completion.
    pub async fn drop_mirrored_event(&self, event_id: Uuid) {
        let conn_guard = self.conn.read().await;
        let Some(ref conn) = *conn_guard else {
            return;
        };
        let key = format!("{}{}", EVENT_PREFIX, event_id);
        let mut conn = conn.clone();
        let _ = redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, ()>(&mut conn)
            .await;
    }

    // ========== Per-entity advisory locks ==========

    /// Try to take the processing lock for an entity. Returns `None` when
    /// Redis is down (callers fall back to in-process locking), `Some(held)`
    /// otherwise. The lock self-expires with the lease.
    pub async fn acquire_entity_lock(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        worker_id: &str,
    ) -> Option<bool> {
        let conn_guard = self.conn.read().await;
        let conn = conn_guard.as_ref()?;

        let key = format!("{}{}:{}", LOCK_PREFIX, entity_type, entity_id);
        let mut conn = conn.clone();
        let result: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(&key)
            .arg(worker_id)
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(reply) => Some(reply.is_some()),
            Err(e) => {
                debug!("Entity lock acquire failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Release the processing lock if this worker still holds it.
    pub async fn release_entity_lock(&self, entity_type: &str, entity_id: Uuid, worker_id: &str) {
        let conn_guard = self.conn.read().await;
        let Some(ref conn) = *conn_guard else {
            return;
        };

        let key = format!("{}{}:{}", LOCK_PREFIX, entity_type, entity_id);
        let mut conn = conn.clone();
        let holder: RedisResult<Option<String>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;
        if let Ok(Some(holder)) = holder {
            if holder == worker_id {
                let _ = redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<_, ()>(&mut conn)
                    .await;
            }
        }
    }

    // ========== Read-through entity cache ==========

    /// Cache an entity snapshot for low-latency reads.
    pub async fn cache_entity(&self, entity_type: &str, entity_id: Uuid, json: &str) {
        let conn_guard = self.conn.read().await;
        let Some(ref conn) = *conn_guard else {
            return;
        };
        let key = format!("{}{}:{}", CACHE_PREFIX, entity_type, entity_id);
        let mut conn = conn.clone();
        if let Err(e) = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(CACHE_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            debug!("Failed to cache {}: {}", key, e);
        }
    }

    pub async fn get_cached_entity(&self, entity_type: &str, entity_id: Uuid) -> Option<String> {
        let conn_guard = self.conn.read().await;
        let conn = conn_guard.as_ref()?;
        let key = format!("{}{}:{}", CACHE_PREFIX, entity_type, entity_id);
        let mut conn = conn.clone();
        let value: RedisResult<Option<String>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;
        value.ok().flatten()
    }

    /// Drop a cached entity after a write or delete.
    pub async fn invalidate_entity(&self, entity_type: &str, entity_id: Uuid) {
        let conn_guard = self.conn.read().await;
        let Some(ref conn) = *conn_guard else {
            return;
        };
        let key = format!("{}{}:{}", CACHE_PREFIX, entity_type, entity_id);
        let mut conn = conn.clone();
        let _ = redis::cmd("DEL")
            .arg(&key)
            .query_async::<_, ()>(&mut conn)
            .await;
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| e.to_string())?;
    encoder.finish().map_err(|e| e.to_string())
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let data = vec![7u8; 50_000];
        let compressed = compress_gzip(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert!(compressed.starts_with(&[0x1f, 0x8b]));
        assert_eq!(decompress_gzip(&compressed).unwrap(), data);
    }

    #[tokio::test]
    async fn test_disconnected_store_degrades() {
        let store = RedisStore::disconnected();
        assert!(!store.is_connected().await);
        assert!(store.ping_ms().await.is_none());
        assert!(store
            .acquire_entity_lock("configuration_item", Uuid::new_v4(), "worker-0")
            .await
            .is_none());
        assert!(store
            .get_cached_entity("configuration_item", Uuid::new_v4())
            .await
            .is_none());
        assert!(store.get_mirrored_event(Uuid::new_v4()).await.is_none());
    }
}
