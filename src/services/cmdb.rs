//! CMDB facade: the contracts the sync core exposes to its excluded
//! collaborators.
//!
//! Writes arrive as `{operation, entity_type, entity_id?, payload,
//! actor_id}` and are validated, persisted and change-captured atomically.
//! Reads go through the in-process cache, then Redis, then the store of
//! record. The operational surface covers force-sync, conflict resolution,
//! full resync and alert management. `CmdbRuntime` wires every component
//! together and owns the background task lifecycle.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::services::conflict::ConflictResolver;
use crate::services::dispatcher::{FailedEvent, SyncDispatcher};
use crate::services::fallback::FallbackController;
use crate::services::monitor::Monitor;
use crate::services::schema_validator;
use crate::services::{
    ChangeCapture, EntityCache, EventQueue, GraphStore, RedisStore, RelationalStore, RuntimeStats,
};
use crate::types::{
    AttributeSchema, AuditEntry, CiFilter, ConfigurationItem, ConflictStrategy, EntityType,
    FieldError, GraphView, HealthSnapshot, Metrics, Page, Relationship, ResyncReport, Role,
    SchemaDefinition, SyncAction, User, UserRole,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

/// A write call from the ingress surface.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub operation: SyncAction,
    pub entity_type: EntityType,
    pub entity_id: Option<Uuid>,
    pub payload: Value,
    pub actor_id: Uuid,
}

/// The entity state after a successful write.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub entity: Value,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn payload_attributes(payload: &Value) -> Map<String, Value> {
    payload
        .get("attributes")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

fn payload_tags(payload: &Value) -> Vec<String> {
    payload
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn payload_uuid(payload: &Value, key: &str) -> Result<Uuid> {
    let text = payload_str(payload, key)
        .ok_or_else(|| SyncError::InvalidRequest(format!("missing field '{}'", key)))?;
    Uuid::parse_str(&text)
        .map_err(|_| SyncError::InvalidRequest(format!("field '{}' is not a UUID", key)))
}

/// The CMDB service surface.
pub struct CmdbService {
    config: Arc<Config>,
    store: Arc<RelationalStore>,
    graph: Arc<GraphStore>,
    redis: RedisStore,
    cache: Arc<EntityCache>,
    capture: Arc<ChangeCapture>,
    resolver: Arc<ConflictResolver>,
    monitor: Arc<Monitor>,
    fallback: Arc<FallbackController>,
}

impl CmdbService {
    // ========== Write ingress ==========

    /// Generic write entry point for the ingress surface.
    pub async fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        match (request.entity_type, request.operation) {
            (EntityType::ConfigurationItem, SyncAction::Create) => {
                let ci = self.create_ci(&request.payload, request.actor_id).await?;
                Ok(WriteResponse {
                    entity: serde_json::to_value(ci)?,
                })
            }
            (EntityType::ConfigurationItem, SyncAction::Update) => {
                let id = request
                    .entity_id
                    .ok_or_else(|| SyncError::InvalidRequest("missing entity_id".to_string()))?;
                let ci = self
                    .update_ci(id, &request.payload, request.actor_id)
                    .await?;
                Ok(WriteResponse {
                    entity: serde_json::to_value(ci)?,
                })
            }
            (EntityType::ConfigurationItem, SyncAction::Delete) => {
                let id = request
                    .entity_id
                    .ok_or_else(|| SyncError::InvalidRequest("missing entity_id".to_string()))?;
                let cascade = request
                    .payload
                    .get("cascade")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.delete_ci(id, request.actor_id, cascade).await?;
                Ok(WriteResponse {
                    entity: serde_json::json!({ "id": id, "deleted": true }),
                })
            }
            (EntityType::Relationship, SyncAction::Create) => {
                let rel = self
                    .create_relationship(&request.payload, request.actor_id)
                    .await?;
                Ok(WriteResponse {
                    entity: serde_json::to_value(rel)?,
                })
            }
            (EntityType::Relationship, SyncAction::Update) => {
                let id = request
                    .entity_id
                    .ok_or_else(|| SyncError::InvalidRequest("missing entity_id".to_string()))?;
                let rel = self
                    .update_relationship(id, &request.payload, request.actor_id)
                    .await?;
                Ok(WriteResponse {
                    entity: serde_json::to_value(rel)?,
                })
            }
            (EntityType::Relationship, SyncAction::Delete) => {
                let id = request
                    .entity_id
                    .ok_or_else(|| SyncError::InvalidRequest("missing entity_id".to_string()))?;
                self.delete_relationship(id, request.actor_id).await?;
                Ok(WriteResponse {
                    entity: serde_json::json!({ "id": id, "deleted": true }),
                })
            }
            (other, operation) => Err(SyncError::InvalidRequest(format!(
                "unsupported write {:?} {:?}",
                operation, other
            ))),
        }
    }

    /// Validate a CI attribute payload against the current schema for its
    /// type. Missing schema accepts the payload as-is.
    fn validate_ci_attributes(
        &self,
        ci_type: &str,
        attributes: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        match self
            .store
            .get_schema(EntityType::ConfigurationItem, ci_type)?
        {
            Some(schema) => {
                let validation = schema_validator::validate(attributes, &schema);
                if !validation.ok {
                    return Err(SyncError::Validation(validation.errors));
                }
                Ok(validation.normalized)
            }
            None => Ok(attributes.clone()),
        }
    }

    fn validate_relationship_attributes(
        &self,
        rel_type: &str,
        attributes: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        match self.store.get_schema(EntityType::Relationship, rel_type)? {
            Some(schema) => {
                let validation = schema_validator::validate(attributes, &schema);
                if !validation.ok {
                    return Err(SyncError::Validation(validation.errors));
                }
                Ok(validation.normalized)
            }
            None => Ok(attributes.clone()),
        }
    }

    pub async fn create_ci(&self, payload: &Value, actor_id: Uuid) -> Result<ConfigurationItem> {
        let name = payload_str(payload, "name")
            .ok_or_else(|| SyncError::Validation(vec![FieldError::new(
                "name",
                "required",
                "missing required attribute",
            )]))?;
        let ci_type = payload_str(payload, "type")
            .ok_or_else(|| SyncError::Validation(vec![FieldError::new(
                "type",
                "required",
                "missing required attribute",
            )]))?;
        let attributes = self.validate_ci_attributes(&ci_type, &payload_attributes(payload))?;

        let now = now_ms();
        let ci = ConfigurationItem {
            id: payload
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4),
            name,
            ci_type,
            attributes,
            tags: payload_tags(payload),
            created_at: now,
            updated_at: now,
            created_by: actor_id,
            updated_by: actor_id,
        };
        self.capture.create_ci(&ci).await?;
        Ok(ci)
    }

    pub async fn update_ci(
        &self,
        id: Uuid,
        payload: &Value,
        actor_id: Uuid,
    ) -> Result<ConfigurationItem> {
        let Some(mut ci) = self.store.get_ci(id)? else {
            return Err(SyncError::NotFound(format!("configuration item {}", id)));
        };
        if let Some(name) = payload_str(payload, "name") {
            ci.name = name;
        }
        if let Some(ci_type) = payload_str(payload, "type") {
            ci.ci_type = ci_type;
        }
        if payload.get("attributes").is_some() {
            ci.attributes = payload_attributes(payload);
        }
        if payload.get("tags").is_some() {
            ci.tags = payload_tags(payload);
        }
        ci.attributes = self.validate_ci_attributes(&ci.ci_type, &ci.attributes)?;
        ci.updated_at = now_ms();
        ci.updated_by = actor_id;

        self.capture.update_ci(&ci).await?;
        Ok(ci)
    }

    pub async fn delete_ci(&self, id: Uuid, actor_id: Uuid, cascade: bool) -> Result<()> {
        self.capture.delete_ci(id, actor_id, cascade).await?;
        Ok(())
    }

    pub async fn create_relationship(
        &self,
        payload: &Value,
        actor_id: Uuid,
    ) -> Result<Relationship> {
        let rel_type = payload_str(payload, "type")
            .ok_or_else(|| SyncError::Validation(vec![FieldError::new(
                "type",
                "required",
                "missing required attribute",
            )]))?;
        let source_id = payload_uuid(payload, "source_id")?;
        let target_id = payload_uuid(payload, "target_id")?;
        let attributes =
            self.validate_relationship_attributes(&rel_type, &payload_attributes(payload))?;

        let now = now_ms();
        let rel = Relationship {
            id: payload
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4),
            rel_type,
            source_id,
            target_id,
            attributes,
            created_at: now,
            updated_at: now,
            created_by: actor_id,
        };
        self.capture.create_relationship(&rel).await?;
        Ok(rel)
    }

    pub async fn update_relationship(
        &self,
        id: Uuid,
        payload: &Value,
        _actor_id: Uuid,
    ) -> Result<Relationship> {
        let Some(mut rel) = self.store.get_relationship(id)? else {
            return Err(SyncError::NotFound(format!("relationship {}", id)));
        };
        if let Some(rel_type) = payload_str(payload, "type") {
            rel.rel_type = rel_type;
        }
        if payload.get("attributes").is_some() {
            rel.attributes = payload_attributes(payload);
        }
        rel.attributes = self.validate_relationship_attributes(&rel.rel_type, &rel.attributes)?;
        rel.updated_at = now_ms();

        self.capture.update_relationship(&rel).await?;
        Ok(rel)
    }

    pub async fn delete_relationship(&self, id: Uuid, actor_id: Uuid) -> Result<()> {
        self.capture.delete_relationship(id, actor_id).await?;
        Ok(())
    }

    pub async fn create_user(&self, user: &User, actor_id: Uuid) -> Result<()> {
        self.capture.create_user(user, actor_id).await?;
        Ok(())
    }

    pub async fn create_role(&self, role: &Role, actor_id: Uuid) -> Result<()> {
        self.capture.create_role(role, actor_id).await?;
        Ok(())
    }

    pub async fn assign_role(&self, assignment: &UserRole) -> Result<()> {
        self.capture.assign_role(assignment).await?;
        Ok(())
    }

    // ========== Schema registration ==========

    pub fn register_ci_schema(
        &self,
        target_type: &str,
        strict: bool,
        attributes: &BTreeMap<String, AttributeSchema>,
    ) -> Result<SchemaDefinition> {
        self.store
            .upsert_schema(EntityType::ConfigurationItem, target_type, strict, attributes)
    }

    pub fn register_relationship_schema(
        &self,
        target_type: &str,
        strict: bool,
        attributes: &BTreeMap<String, AttributeSchema>,
    ) -> Result<SchemaDefinition> {
        self.store
            .upsert_schema(EntityType::Relationship, target_type, strict, attributes)
    }

    // ========== Read ingress ==========

    /// Read a CI through the cache hierarchy: in-process, then Redis, then
    /// the store of record.
    pub async fn get_ci(&self, id: Uuid) -> Result<ConfigurationItem> {
        if let Some(json) = self.cache.get(EntityType::ConfigurationItem, id) {
            if let Ok(ci) = serde_json::from_str(&json) {
                return Ok(ci);
            }
        }
        if let Some(json) = self
            .redis
            .get_cached_entity(EntityType::ConfigurationItem.as_str(), id)
            .await
        {
            if let Ok(ci) = serde_json::from_str::<ConfigurationItem>(&json) {
                self.cache.put(EntityType::ConfigurationItem, id, json);
                return Ok(ci);
            }
        }

        let Some(ci) = self.store.get_ci(id)? else {
            return Err(SyncError::NotFound(format!("configuration item {}", id)));
        };
        let json = serde_json::to_string(&ci)?;
        self.cache
            .put(EntityType::ConfigurationItem, id, json.clone());
        self.redis
            .cache_entity(EntityType::ConfigurationItem.as_str(), id, &json)
            .await;
        Ok(ci)
    }

    pub fn list_cis(&self, filter: &CiFilter) -> Result<Page<ConfigurationItem>> {
        self.store.list_cis(filter)
    }

    pub fn get_relationship(&self, id: Uuid) -> Result<Relationship> {
        self.store
            .get_relationship(id)?
            .ok_or_else(|| SyncError::NotFound(format!("relationship {}", id)))
    }

    /// Traversal query over the graph projection.
    pub fn graph_query(
        &self,
        root_id: Uuid,
        depth: usize,
        type_filter: Option<&str>,
    ) -> Result<GraphView> {
        self.graph.traverse(root_id, depth, type_filter)
    }

    pub fn audit_trail(&self, entity_type: EntityType, id: Uuid) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_entity(entity_type, id)
    }

    // ========== Health and operational surface ==========

    pub async fn health(&self) -> HealthSnapshot {
        self.monitor.snapshot().await
    }

    pub async fn metrics(&self) -> Result<Metrics> {
        self.monitor.metrics().await
    }

    /// Rebuild a fresh sync event from the current relational snapshot.
    pub async fn force_sync(&self, entity_type: EntityType, id: Uuid) -> Result<()> {
        self.capture.force_sync(entity_type, id).await?;
        Ok(())
    }

    pub fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        strategy_override: Option<ConflictStrategy>,
        actor_id: Uuid,
    ) -> Result<()> {
        self.resolver
            .resolve_by_id(conflict_id, strategy_override, actor_id)
    }

    pub async fn trigger_full_resync(&self) -> Result<ResyncReport> {
        self.fallback.trigger_full_resync().await
    }

    pub fn clear_alert(&self, alert_id: Uuid) -> Result<()> {
        self.store.clear_alert(alert_id)
    }
}

/// Fully wired sync core plus the background task lifecycle.
pub struct CmdbRuntime {
    pub service: Arc<CmdbService>,
    pub store: Arc<RelationalStore>,
    pub graph: Arc<GraphStore>,
    pub queue: Arc<EventQueue>,
    pub dispatcher: Arc<SyncDispatcher>,
    pub resolver: Arc<ConflictResolver>,
    pub monitor: Arc<Monitor>,
    pub fallback: Arc<FallbackController>,
    error_rx: Option<mpsc::Receiver<FailedEvent>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CmdbRuntime {
    /// Build every component against the configured stores. Nothing is
    /// spawned until `start`.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(if config.db_path == ":memory:" {
            RelationalStore::new_in_memory()?
        } else {
            RelationalStore::new(&config.db_path)?
        });
        let graph = GraphStore::new();
        let redis = match &config.redis_url {
            Some(url) => RedisStore::new(url).await,
            None => RedisStore::disconnected(),
        };
        let cache = Arc::new(EntityCache::new(Duration::from_secs(300)));

        let stats = Arc::new(RuntimeStats::new());
        stats.init_from(&store.get_stats()?);

        let queue = EventQueue::new(store.clone(), redis.clone(), config.clone());
        let capture = ChangeCapture::new(
            store.clone(),
            queue.clone(),
            redis.clone(),
            cache.clone(),
        );
        let resolver =
            ConflictResolver::new(store.clone(), graph.clone(), config.clone(), stats.clone());
        let (dispatcher, error_rx) = SyncDispatcher::new(
            store.clone(),
            graph.clone(),
            resolver.clone(),
            queue.clone(),
            redis.clone(),
            config.clone(),
            stats.clone(),
        );
        let monitor = Monitor::new(
            store.clone(),
            graph.clone(),
            redis.clone(),
            config.clone(),
            stats.clone(),
        );
        let fallback = FallbackController::new(
            store.clone(),
            graph.clone(),
            resolver.clone(),
            queue.clone(),
            capture.clone(),
            config.clone(),
            stats.clone(),
        );

        let service = Arc::new(CmdbService {
            config: config.clone(),
            store: store.clone(),
            graph: graph.clone(),
            redis,
            cache,
            capture,
            resolver: resolver.clone(),
            monitor: monitor.clone(),
            fallback: fallback.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            service,
            store,
            graph,
            queue,
            dispatcher,
            resolver,
            monitor,
            fallback,
            error_rx: Some(error_rx),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawn the worker pool and every background loop.
    pub fn start(&mut self) {
        info!("Starting sync core background tasks");
        self.dispatcher.clone().start(self.shutdown_rx.clone());
        if let Some(error_rx) = self.error_rx.take() {
            self.fallback
                .clone()
                .start(error_rx, self.shutdown_rx.clone());
        }
        self.monitor.clone().start(self.shutdown_rx.clone());
        self.resolver.clone().start_sweep(self.shutdown_rx.clone());
        self.queue.clone().start_cleanup(self.shutdown_rx.clone());
    }

    /// Signal every loop to stop; in-flight events finish or are abandoned
    /// at their next suspension point and reclaimed by lease timeout.
    pub fn shutdown(&self) {
        info!("Shutting down sync core");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn worker_count(&self) -> usize {
        self.service.config.worker_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeType;
    use serde_json::json;

    async fn runtime() -> CmdbRuntime {
        let mut config = Config::from_env();
        config.db_path = ":memory:".to_string();
        config.redis_url = None;
        config.retry_delay_ms = 0;
        CmdbRuntime::bootstrap(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let runtime = runtime().await;
        let actor = Uuid::new_v4();

        let response = runtime
            .service
            .write(WriteRequest {
                operation: SyncAction::Create,
                entity_type: EntityType::ConfigurationItem,
                entity_id: None,
                payload: json!({
                    "name": "web-01",
                    "type": "server",
                    "attributes": { "ip": "10.0.0.1" },
                    "tags": ["prod"]
                }),
                actor_id: actor,
            })
            .await
            .unwrap();

        let id = Uuid::parse_str(response.entity["id"].as_str().unwrap()).unwrap();
        let ci = runtime.service.get_ci(id).await.unwrap();
        assert_eq!(ci.name, "web-01");
        assert_eq!(ci.attributes["ip"], "10.0.0.1");
        assert_eq!(ci.created_by, actor);

        // Second read is served from cache.
        let cached = runtime.service.get_ci(id).await.unwrap();
        assert_eq!(cached.name, "web-01");
    }

    #[tokio::test]
    async fn test_schema_rejection_at_write_time() {
        let runtime = runtime().await;
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "ip".to_string(),
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                required: true,
                ..Default::default()
            },
        );
        runtime
            .service
            .register_ci_schema("server", false, &attributes)
            .unwrap();

        let result = runtime
            .service
            .create_ci(
                &json!({ "name": "web-01", "type": "server", "attributes": {} }),
                Uuid::new_v4(),
            )
            .await;
        assert!(matches!(result, Err(SyncError::Validation(_))));

        // No event was captured for the rejected write.
        assert_eq!(runtime.store.queue_depths().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_write_without_schema_accepted() {
        let runtime = runtime().await;
        let ci = runtime
            .service
            .create_ci(
                &json!({
                    "name": "mystery",
                    "type": "unregistered",
                    "attributes": { "anything": [1, 2, 3] }
                }),
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        assert_eq!(ci.attributes["anything"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_graph_query_after_dispatch() {
        let runtime = runtime().await;
        let actor = Uuid::new_v4();
        let a = runtime
            .service
            .create_ci(&json!({ "name": "app", "type": "application" }), actor)
            .await
            .unwrap();
        let b = runtime
            .service
            .create_ci(&json!({ "name": "db", "type": "database" }), actor)
            .await
            .unwrap();
        runtime
            .service
            .create_relationship(
                &json!({
                    "type": "DEPENDS_ON",
                    "source_id": a.id.to_string(),
                    "target_id": b.id.to_string()
                }),
                actor,
            )
            .await
            .unwrap();

        // Drain the queue deterministically.
        while runtime.dispatcher.run_once("worker-0").await.unwrap() > 0 {}

        let view = runtime.service.graph_query(a.id, 2, None).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.edges.len(), 1);
        assert_eq!(view.edges[0].rel_type, "DEPENDS_ON");
    }

    #[tokio::test]
    async fn test_force_sync_and_full_resync_surface() {
        let runtime = runtime().await;
        let actor = Uuid::new_v4();
        let ci = runtime
            .service
            .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
            .await
            .unwrap();

        runtime
            .service
            .force_sync(EntityType::ConfigurationItem, ci.id)
            .await
            .unwrap();
        let events = runtime
            .store
            .events_for_entity(EntityType::ConfigurationItem, ci.id)
            .unwrap();
        assert_eq!(events.len(), 2);

        let report = runtime.service.trigger_full_resync().await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_audit_trail_via_facade() {
        let runtime = runtime().await;
        let actor = Uuid::new_v4();
        let ci = runtime
            .service
            .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
            .await
            .unwrap();
        runtime
            .service
            .update_ci(ci.id, &json!({ "tags": ["prod"] }), actor)
            .await
            .unwrap();

        let trail = runtime
            .service
            .audit_trail(EntityType::ConfigurationItem, ci.id)
            .unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].changed_by, actor);
    }
}
