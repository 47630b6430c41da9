//! Change capture: the single entry point for durable writes.
//!
//! Every mutation of a captured table goes through here. The relational
//! store performs the write and the event insert in one transaction, so a
//! committed change always has exactly one sync event; this service adds
//! the post-commit steps that are acceleration only: mirroring the event to
//! Redis and invalidating cached snapshots.

use crate::error::Result;
use crate::services::{EntityCache, EventQueue, RedisStore, RelationalStore};
use crate::types::{
    ConfigurationItem, EntityType, Relationship, Role, SyncAction, SyncEvent, User, UserRole,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Transactional write-and-capture pipeline.
pub struct ChangeCapture {
    store: Arc<RelationalStore>,
    queue: Arc<EventQueue>,
    redis: RedisStore,
    cache: Arc<EntityCache>,
}

impl ChangeCapture {
    pub fn new(
        store: Arc<RelationalStore>,
        queue: Arc<EventQueue>,
        redis: RedisStore,
        cache: Arc<EntityCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            redis,
            cache,
        })
    }

    /// Post-commit bookkeeping shared by every write.
    async fn after_commit(&self, event: &SyncEvent) {
        self.queue.record(event).await;
        self.cache.invalidate(event.entity_type, event.entity_id);
        self.redis
            .invalidate_entity(event.entity_type.as_str(), event.entity_id)
            .await;
        debug!(
            "Captured {:?} {:?} for {} (event {})",
            event.action, event.entity_type, event.entity_id, event.id
        );
    }

    pub async fn create_ci(&self, ci: &ConfigurationItem) -> Result<SyncEvent> {
        let event = self.store.create_ci(ci)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn update_ci(&self, ci: &ConfigurationItem) -> Result<SyncEvent> {
        let event = self.store.update_ci(ci)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn delete_ci(
        &self,
        id: Uuid,
        actor_id: Uuid,
        cascade: bool,
    ) -> Result<Vec<SyncEvent>> {
        let events = self.store.delete_ci(id, actor_id, cascade)?;
        for event in &events {
            self.after_commit(event).await;
        }
        Ok(events)
    }

    pub async fn create_relationship(&self, rel: &Relationship) -> Result<SyncEvent> {
        let event = self.store.create_relationship(rel)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn update_relationship(&self, rel: &Relationship) -> Result<SyncEvent> {
        let event = self.store.update_relationship(rel)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn delete_relationship(&self, id: Uuid, actor_id: Uuid) -> Result<SyncEvent> {
        let event = self.store.delete_relationship(id, actor_id)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn create_user(&self, user: &User, actor_id: Uuid) -> Result<SyncEvent> {
        let event = self.store.create_user(user, actor_id)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn create_role(&self, role: &Role, actor_id: Uuid) -> Result<SyncEvent> {
        let event = self.store.create_role(role, actor_id)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    pub async fn assign_role(&self, assignment: &UserRole) -> Result<SyncEvent> {
        let event = self.store.assign_role(assignment)?;
        self.after_commit(&event).await;
        Ok(event)
    }

    /// Rebuild a fresh event from the current relational snapshot
    /// (force-sync and resync paths).
    pub async fn force_sync(&self, entity_type: EntityType, id: Uuid) -> Result<SyncEvent> {
        let event = self
            .store
            .emit_synthetic_event(entity_type, id, SyncAction::Update)?;
        self.after_commit(&event).await;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::event_queue::EventQueue;
    use crate::types::EventStatus;
    use serde_json::Map;
    use std::time::Duration;

    async fn capture() -> (Arc<RelationalStore>, Arc<ChangeCapture>) {
        let store = Arc::new(RelationalStore::new_in_memory().unwrap());
        let config = Arc::new(Config {
            db_path: ":memory:".to_string(),
            redis_url: None,
            worker_count: 1,
            batch_size: 10,
            retry_limit: 3,
            retry_delay_ms: 1_000,
            retry_backoff_cap_ms: 300_000,
            event_ttl_days: 30,
            cleanup_interval_min: 60,
            conflict_strategy: crate::types::ConflictStrategy::RelationalWins,
            conflict_sweep_window_min: 5,
            fallback_strategy: crate::types::FallbackStrategy::Queue,
            fallback_queue_threshold: 100,
            fallback_selective_limit: 50,
            monitor_interval_sec: 30,
            monitor_alert_ttl_hours: 24,
            poll_interval_ms: 1_000,
            lease_timeout_sec: 60,
            backpressure_threshold: 1_000,
            relational_timeout_ms: 5_000,
            graph_timeout_ms: 10_000,
            cache_timeout_ms: 2_000,
        });
        let queue = EventQueue::new(store.clone(), RedisStore::disconnected(), config);
        let capture = ChangeCapture::new(
            store.clone(),
            queue,
            RedisStore::disconnected(),
            Arc::new(EntityCache::new(Duration::from_secs(300))),
        );
        (store, capture)
    }

    fn ci(name: &str) -> ConfigurationItem {
        let now = chrono::Utc::now().timestamp_millis();
        ConfigurationItem {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec![],
            created_at: now,
            updated_at: now,
            created_by: Uuid::new_v4(),
            updated_by: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_create_produces_pending_event() {
        let (store, capture) = capture().await;
        let item = ci("web-01");
        let event = capture.create_ci(&item).await.unwrap();
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(
            store
                .events_for_entity(EntityType::ConfigurationItem, item.id)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_force_sync_emits_update_snapshot() {
        let (store, capture) = capture().await;
        let item = ci("web-01");
        capture.create_ci(&item).await.unwrap();

        let event = capture
            .force_sync(EntityType::ConfigurationItem, item.id)
            .await
            .unwrap();
        assert_eq!(event.action, SyncAction::Update);
        assert_eq!(event.payload["name"], "web-01");
        assert_eq!(
            store
                .events_for_entity(EntityType::ConfigurationItem, item.id)
                .unwrap()
                .len(),
            2
        );
    }
}
