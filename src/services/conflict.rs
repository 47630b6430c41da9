//! Conflict detection and resolution between the two stores.
//!
//! Detection runs inline (before the dispatcher applies an UPDATE whose
//! projection is newer than the event) and periodically (a sweep over
//! recently updated entities comparing both stores field by field, with a
//! checksum fast-path). Resolution applies the configured strategy and, on
//! success, leaves both stores agreeing on the full entity state with a
//! monotonically advanced `updated_at`.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::services::monitor::raise_alert;
use crate::services::{GraphEdge, GraphNode, GraphStore, RelationalStore, RuntimeStats};
use crate::types::{
    AlertSeverity, ConfigurationItem, ConflictRecord, ConflictStrategy, ConflictType, EntityType,
    Relationship,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timestamps within this window are considered simultaneous.
const TIMESTAMP_TOLERANCE_MS: i64 = 5_000;

/// What the dispatcher should do with an UPDATE event after the inline
/// conflict check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineDecision {
    /// No conflict, or resolution chose the relational side: apply.
    Apply,
    /// Resolution kept (or merged into) the projection: skip the apply,
    /// the event completes as a no-op.
    Skip,
}

pub struct ConflictResolver {
    store: Arc<RelationalStore>,
    graph: Arc<GraphStore>,
    config: Arc<Config>,
    stats: Arc<RuntimeStats>,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<RelationalStore>,
        graph: Arc<GraphStore>,
        config: Arc<Config>,
        stats: Arc<RuntimeStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            graph,
            config,
            stats,
        })
    }

    // ========== Detection ==========

    /// Inline check before a CI UPDATE applies. Declares a conflict only
    /// when the projection claims to be newer than the event's post-image.
    pub fn inline_check_ci(&self, incoming: &ConfigurationItem) -> Result<InlineDecision> {
        let Some(node) = self.graph.get_node(incoming.id)? else {
            return Ok(InlineDecision::Apply);
        };
        if node.updated_at <= incoming.updated_at + TIMESTAMP_TOLERANCE_MS {
            return Ok(InlineDecision::Apply);
        }

        let conflict_type = if ci_checksum(incoming) == node_checksum(&node) {
            ConflictType::Timestamp
        } else {
            ConflictType::DataMismatch
        };
        warn!(
            "Projection of {} is newer than incoming update ({} > {})",
            incoming.id, node.updated_at, incoming.updated_at
        );

        let record = self.record_conflict(
            EntityType::ConfigurationItem,
            incoming.id,
            conflict_type,
            serde_json::to_value(incoming)?,
            node.snapshot(),
        )?;
        match record {
            Some(record) => self.resolve(&record, None, None),
            // An unresolved record already exists for this entity; keep the
            // projection untouched until it resolves.
            None => Ok(InlineDecision::Skip),
        }
    }

    /// Compare one CI across stores (sweep path). Returns the conflict type
    /// if the stores diverge.
    fn detect_ci(&self, ci: &ConfigurationItem) -> Result<Option<(ConflictType, Value)>> {
        let Some(node) = self.graph.get_node(ci.id)? else {
            return Ok(Some((ConflictType::Missing, Value::Null)));
        };
        if ci_checksum(ci) != node_checksum(&node) {
            return Ok(Some((ConflictType::DataMismatch, node.snapshot())));
        }
        if (ci.updated_at - node.updated_at).abs() > TIMESTAMP_TOLERANCE_MS {
            return Ok(Some((ConflictType::Timestamp, node.snapshot())));
        }
        Ok(None)
    }

    fn detect_relationship(&self, rel: &Relationship) -> Result<Option<(ConflictType, Value)>> {
        let Some(edge) = self.graph.get_edge(rel.id)? else {
            return Ok(Some((ConflictType::Missing, Value::Null)));
        };
        if edge.source_id != rel.source_id || edge.target_id != rel.target_id {
            return Ok(Some((ConflictType::Relationship, edge.snapshot())));
        }
        if relationship_checksum(rel) != edge_checksum(&edge) {
            return Ok(Some((ConflictType::DataMismatch, edge.snapshot())));
        }
        Ok(None)
    }

    /// Persist a conflict record; the unique partial index keeps one
    /// unresolved record per entity. Returns None when one already exists.
    fn record_conflict(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        conflict_type: ConflictType,
        relational_snapshot: Value,
        graph_snapshot: Value,
    ) -> Result<Option<ConflictRecord>> {
        let now = chrono::Utc::now().timestamp_millis();
        let record = ConflictRecord {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            conflict_type,
            relational_snapshot,
            graph_snapshot,
            strategy: self.config.conflict_strategy,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            detected_at: now,
            updated_at: now,
        };
        if !self.store.insert_conflict(&record)? {
            return Ok(None);
        }
        self.stats.record_conflict_detected();
        self.store.bump_stats(0, 0, 1, 0, 0)?;
        info!(
            "Recorded {:?} conflict for {:?} {}",
            conflict_type, entity_type, entity_id
        );
        Ok(Some(record))
    }

    // ========== Resolution ==========

    /// Apply a resolution strategy. Returns the dispatcher decision for the
    /// inline path: Apply when the relational side won, Skip otherwise.
    pub fn resolve(
        &self,
        record: &ConflictRecord,
        strategy_override: Option<ConflictStrategy>,
        actor_id: Option<Uuid>,
    ) -> Result<InlineDecision> {
        let strategy = strategy_override.unwrap_or(record.strategy);
        let decision = match strategy {
            ConflictStrategy::RelationalWins => self.resolve_relational_wins(record, actor_id)?,
            ConflictStrategy::GraphWins => self.resolve_graph_wins(record, actor_id)?,
            ConflictStrategy::Timestamp => {
                let rel_ts = snapshot_updated_at(&record.relational_snapshot);
                let graph_ts = snapshot_updated_at(&record.graph_snapshot);
                if rel_ts >= graph_ts {
                    self.resolve_relational_wins(record, actor_id)?
                } else {
                    self.resolve_graph_wins(record, actor_id)?
                }
            }
            ConflictStrategy::Merge => self.resolve_merge(record, actor_id)?,
            ConflictStrategy::Manual => {
                raise_alert(
                    &self.store,
                    AlertSeverity::Error,
                    "conflict_manual",
                    format!(
                        "manual resolution required for {:?} {}",
                        record.entity_type, record.entity_id
                    ),
                    json!({ "conflict_id": record.id }),
                    self.config.monitor_alert_ttl_hours,
                )?;
                return Ok(InlineDecision::Skip);
            }
        };
        self.store.mark_conflict_resolved(record.id, actor_id)?;
        self.stats.record_conflict_resolved();
        self.store.bump_stats(0, 0, 0, 1, 0)?;
        Ok(decision)
    }

    /// Overwrite the projection with the relational snapshot, verbatim.
    /// The store of record is authoritative, so the projection mirrors its
    /// content and its `updated_at` exactly; advancing only the graph side
    /// would re-flag a timestamp divergence on the next sweep.
    fn resolve_relational_wins(
        &self,
        record: &ConflictRecord,
        _actor_id: Option<Uuid>,
    ) -> Result<InlineDecision> {
        match record.entity_type {
            EntityType::ConfigurationItem => {
                if record.relational_snapshot.is_null() {
                    // Present only in the graph: the store of record has no
                    // such entity, drop the projection.
                    self.graph.delete_node(record.entity_id)?;
                    return Ok(InlineDecision::Skip);
                }
                let ci: ConfigurationItem =
                    serde_json::from_value(record.relational_snapshot.clone())?;
                let now = chrono::Utc::now().timestamp_millis();
                self.graph.merge_node(GraphNode::from_ci(&ci, now))?;
            }
            EntityType::Relationship => {
                if record.relational_snapshot.is_null() {
                    self.graph.delete_edge(record.entity_id)?;
                    return Ok(InlineDecision::Skip);
                }
                let rel: Relationship =
                    serde_json::from_value(record.relational_snapshot.clone())?;
                let now = chrono::Utc::now().timestamp_millis();
                self.graph.merge_edge(GraphEdge::from_relationship(&rel, now))?;
            }
            other => {
                return Err(SyncError::InvalidRequest(format!(
                    "{} entities are not projected",
                    other.as_str()
                )))
            }
        }
        Ok(InlineDecision::Apply)
    }

    /// Overwrite the relational row with the graph snapshot. The relational
    /// write is captured like any other change, so the projection
    /// re-converges through the normal pipeline.
    fn resolve_graph_wins(
        &self,
        record: &ConflictRecord,
        actor_id: Option<Uuid>,
    ) -> Result<InlineDecision> {
        let actor = actor_id.unwrap_or_else(Uuid::nil);
        match record.entity_type {
            EntityType::ConfigurationItem => {
                if record.graph_snapshot.is_null() {
                    // Present only in the relational store; graph wins means
                    // the row goes away.
                    self.store.delete_ci(record.entity_id, actor, true)?;
                    return Ok(InlineDecision::Skip);
                }
                let node: GraphNode = serde_json::from_value(record.graph_snapshot.clone())?;
                let Some(mut ci) = self.store.get_ci(record.entity_id)? else {
                    return Err(SyncError::NotFound(format!(
                        "configuration item {}",
                        record.entity_id
                    )));
                };
                ci.name = node.name;
                ci.ci_type = node.ci_type;
                ci.attributes = node.attributes;
                ci.tags = node.tags;
                ci.updated_at = advanced_ts(record);
                ci.updated_by = actor;
                self.store.update_ci(&ci)?;
                let now = chrono::Utc::now().timestamp_millis();
                self.graph.merge_node(GraphNode::from_ci(&ci, now))?;
            }
            EntityType::Relationship => {
                if record.graph_snapshot.is_null() {
                    self.store.delete_relationship(record.entity_id, actor)?;
                    return Ok(InlineDecision::Skip);
                }
                let edge: GraphEdge = serde_json::from_value(record.graph_snapshot.clone())?;
                let Some(mut rel) = self.store.get_relationship(record.entity_id)? else {
                    return Err(SyncError::NotFound(format!(
                        "relationship {}",
                        record.entity_id
                    )));
                };
                rel.rel_type = edge.rel_type;
                rel.attributes = edge.attributes;
                rel.updated_at = advanced_ts(record);
                self.store.update_relationship(&rel)?;
                let now = chrono::Utc::now().timestamp_millis();
                self.graph.merge_edge(GraphEdge::from_relationship(&rel, now))?;
            }
            other => {
                return Err(SyncError::InvalidRequest(format!(
                    "{} entities are not projected",
                    other.as_str()
                )))
            }
        }
        Ok(InlineDecision::Skip)
    }

    /// Union the attribute maps; the newer side wins on key collision,
    /// arrays are unioned with de-duplication and nested objects merge
    /// recursively under the same rules.
    fn resolve_merge(
        &self,
        record: &ConflictRecord,
        actor_id: Option<Uuid>,
    ) -> Result<InlineDecision> {
        if record.relational_snapshot.is_null() || record.graph_snapshot.is_null() {
            // Nothing to merge when one side is absent; fall back to the
            // side that exists.
            return if record.relational_snapshot.is_null() {
                self.resolve_graph_wins(record, actor_id)
            } else {
                self.resolve_relational_wins(record, actor_id)
            };
        }
        if record.entity_type != EntityType::ConfigurationItem {
            // Relationship attribute maps merge through the same machinery.
            let edge: GraphEdge = serde_json::from_value(record.graph_snapshot.clone())?;
            let Some(mut rel) = self.store.get_relationship(record.entity_id)? else {
                return Err(SyncError::NotFound(format!(
                    "relationship {}",
                    record.entity_id
                )));
            };
            let rel_newer = rel.updated_at >= edge.updated_at;
            let merged = merge_values(
                &Value::Object(rel.attributes.clone()),
                &Value::Object(edge.attributes.clone()),
                rel_newer,
            );
            rel.attributes = merged.as_object().cloned().unwrap_or_default();
            rel.updated_at = advanced_ts(record);
            self.store.update_relationship(&rel)?;
            let now = chrono::Utc::now().timestamp_millis();
            self.graph.merge_edge(GraphEdge::from_relationship(&rel, now))?;
            return Ok(InlineDecision::Skip);
        }

        let node: GraphNode = serde_json::from_value(record.graph_snapshot.clone())?;
        let Some(mut ci) = self.store.get_ci(record.entity_id)? else {
            return Err(SyncError::NotFound(format!(
                "configuration item {}",
                record.entity_id
            )));
        };
        let rel_newer = ci.updated_at >= node.updated_at;

        let merged = merge_values(
            &Value::Object(ci.attributes.clone()),
            &Value::Object(node.attributes.clone()),
            rel_newer,
        );
        ci.attributes = merged.as_object().cloned().unwrap_or_default();

        // Scalar fields follow the newer side.
        if !rel_newer {
            ci.name = node.name.clone();
            ci.ci_type = node.ci_type.clone();
        }
        let mut tags: Vec<String> = ci.tags.clone();
        for tag in &node.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        ci.tags = tags;
        ci.updated_at = advanced_ts(record);
        if let Some(actor) = actor_id {
            ci.updated_by = actor;
        }

        self.store.update_ci(&ci)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.graph.merge_node(GraphNode::from_ci(&ci, now))?;
        Ok(InlineDecision::Skip)
    }

    /// Operational surface: resolve one conflict by id, optionally forcing
    /// a strategy.
    pub fn resolve_by_id(
        &self,
        conflict_id: Uuid,
        strategy_override: Option<ConflictStrategy>,
        actor_id: Uuid,
    ) -> Result<()> {
        let Some(record) = self.store.get_conflict(conflict_id)? else {
            return Err(SyncError::NotFound(format!("conflict {}", conflict_id)));
        };
        if record.resolved {
            return Err(SyncError::InvalidRequest(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }
        self.resolve(&record, strategy_override, Some(actor_id))?;
        Ok(())
    }

    // ========== Periodic sweep ==========

    /// One sweep pass over entities updated inside the window.
    pub fn sweep(&self) -> Result<usize> {
        let window_ms = (self.config.conflict_sweep_window_min as i64) * 60_000;
        let since = chrono::Utc::now().timestamp_millis() - window_ms;
        let mut detected = 0;

        for ci in self.store.cis_updated_since(since)? {
            // Entities with an undispatched event are not divergent yet,
            // they are in flight.
            if self.has_pending_events(EntityType::ConfigurationItem, ci.id)? {
                continue;
            }
            if let Some((conflict_type, graph_snapshot)) = self.detect_ci(&ci)? {
                let record = self.record_conflict(
                    EntityType::ConfigurationItem,
                    ci.id,
                    conflict_type,
                    serde_json::to_value(&ci)?,
                    graph_snapshot,
                )?;
                if let Some(record) = record {
                    detected += 1;
                    if let Err(e) = self.resolve(&record, None, None) {
                        error!("Failed to resolve conflict {}: {}", record.id, e);
                    }
                }
            }
        }

        for rel in self.store.relationships_updated_since(since)? {
            if self.has_pending_events(EntityType::Relationship, rel.id)? {
                continue;
            }
            if let Some((conflict_type, graph_snapshot)) = self.detect_relationship(&rel)? {
                let record = self.record_conflict(
                    EntityType::Relationship,
                    rel.id,
                    conflict_type,
                    serde_json::to_value(&rel)?,
                    graph_snapshot,
                )?;
                if let Some(record) = record {
                    detected += 1;
                    if let Err(e) = self.resolve(&record, None, None) {
                        error!("Failed to resolve conflict {}: {}", record.id, e);
                    }
                }
            }
        }

        if detected > 0 {
            info!("Conflict sweep detected {} divergence(s)", detected);
        } else {
            debug!("Conflict sweep found no divergence");
        }
        Ok(detected)
    }

    fn has_pending_events(&self, entity_type: EntityType, id: Uuid) -> Result<bool> {
        let events = self.store.events_for_entity(entity_type, id)?;
        Ok(events.iter().any(|e| {
            matches!(
                e.status,
                crate::types::EventStatus::Pending | crate::types::EventStatus::Processing
            )
        }))
    }

    /// Background sweep loop; exits on shutdown.
    pub fn start_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval_min = self.config.conflict_sweep_window_min;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_min as u64 * 60));
            info!("Conflict sweep loop started (every {} min)", interval_min);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep() {
                            error!("Conflict sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Conflict sweep loop stopping");
                        break;
                    }
                }
            }
        });
    }
}

/// Timestamp for a resolved entity: strictly above both sides.
fn advanced_ts(record: &ConflictRecord) -> i64 {
    let rel_ts = snapshot_updated_at(&record.relational_snapshot);
    let graph_ts = snapshot_updated_at(&record.graph_snapshot);
    rel_ts.max(graph_ts).max(chrono::Utc::now().timestamp_millis()) + 1
}

fn snapshot_updated_at(snapshot: &Value) -> i64 {
    snapshot
        .get("updated_at")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Merge two JSON values; `left_newer` breaks ties on collision.
/// Objects union recursively, arrays union with de-duplication, scalars
/// follow the newer side.
pub fn merge_values(left: &Value, right: &Value, left_newer: bool) -> Value {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut merged = Map::new();
            for (key, left_value) in l {
                match r.get(key) {
                    Some(right_value) => {
                        merged.insert(
                            key.clone(),
                            merge_values(left_value, right_value, left_newer),
                        );
                    }
                    None => {
                        merged.insert(key.clone(), left_value.clone());
                    }
                }
            }
            for (key, right_value) in r {
                if !l.contains_key(key) {
                    merged.insert(key.clone(), right_value.clone());
                }
            }
            Value::Object(merged)
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut merged = l.clone();
            for item in r {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (l, r) => {
            if left_newer {
                l.clone()
            } else {
                r.clone()
            }
        }
    }
}

/// Canonical JSON with sorted keys, so checksums ignore map ordering.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn checksum_of(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Checksum over the projected fields of a CI.
fn ci_checksum(ci: &ConfigurationItem) -> String {
    checksum_of(&json!({
        "name": ci.name,
        "type": ci.ci_type,
        "attributes": ci.attributes,
        "tags": ci.tags,
    }))
}

fn node_checksum(node: &GraphNode) -> String {
    checksum_of(&json!({
        "name": node.name,
        "type": node.ci_type,
        "attributes": node.attributes,
        "tags": node.tags,
    }))
}

fn relationship_checksum(rel: &Relationship) -> String {
    checksum_of(&json!({
        "type": rel.rel_type,
        "attributes": rel.attributes,
    }))
}

fn edge_checksum(edge: &GraphEdge) -> String {
    checksum_of(&json!({
        "type": edge.rel_type,
        "attributes": edge.attributes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver_with(
        strategy: ConflictStrategy,
    ) -> (Arc<RelationalStore>, Arc<GraphStore>, Arc<ConflictResolver>) {
        let store = Arc::new(RelationalStore::new_in_memory().unwrap());
        let graph = GraphStore::new();
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
            conflict_strategy: strategy,
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
        let stats = Arc::new(RuntimeStats::new());
        let resolver = ConflictResolver::new(store.clone(), graph.clone(), config, stats);
        (store, graph, resolver)
    }

    fn seed_divergent_ci(
        store: &RelationalStore,
        graph: &GraphStore,
        rel_name: &str,
        graph_name: &str,
        rel_ts: i64,
        graph_ts: i64,
    ) -> ConfigurationItem {
        let ci = ConfigurationItem {
            id: Uuid::new_v4(),
            name: rel_name.to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec![],
            created_at: rel_ts,
            updated_at: rel_ts,
            created_by: Uuid::new_v4(),
            updated_by: Uuid::new_v4(),
        };
        store.create_ci(&ci).unwrap();
        let mut node = GraphNode::from_ci(&ci, graph_ts);
        node.name = graph_name.to_string();
        node.updated_at = graph_ts;
        graph.merge_node(node).unwrap();
        ci
    }

    #[test]
    fn test_merge_values_scalar_newer_wins() {
        let left = json!({ "cpu": 4, "rack": "r1" });
        let right = json!({ "cpu": 8, "zone": "z1" });
        let merged = merge_values(&left, &right, false);
        assert_eq!(merged["cpu"], 8);
        assert_eq!(merged["rack"], "r1");
        assert_eq!(merged["zone"], "z1");

        let merged = merge_values(&left, &right, true);
        assert_eq!(merged["cpu"], 4);
    }

    #[test]
    fn test_merge_values_arrays_union_dedup() {
        let left = json!(["a", "b"]);
        let right = json!(["b", "c"]);
        let merged = merge_values(&left, &right, true);
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_merge_values_nested_objects_recursive() {
        let left = json!({ "hw": { "vendor": "dell", "disks": ["sda"] } });
        let right = json!({ "hw": { "vendor": "hp", "disks": ["sdb"], "ram": 64 } });
        let merged = merge_values(&left, &right, false);
        assert_eq!(merged["hw"]["vendor"], "hp");
        assert_eq!(merged["hw"]["ram"], 64);
        assert_eq!(merged["hw"]["disks"], json!(["sda", "sdb"]));
    }

    #[test]
    fn test_canonicalize_is_order_insensitive() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":3,"b":2},"x":1}"#).unwrap();
        assert_eq!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn test_timestamp_strategy_graph_newer_wins() {
        let (store, graph, resolver) = resolver_with(ConflictStrategy::Timestamp);
        let now = chrono::Utc::now().timestamp_millis();
        let t1 = now - 120_000;
        let t2 = now - 60_000;
        let ci = seed_divergent_ci(&store, &graph, "old-name", "new-name", t1, t2);

        // Drain the capture event from the seeding write so the sweep does
        // not mistake in-flight state for divergence.
        let event = store.claim_events("w", 10, 60_000).unwrap().remove(0);
        store.complete_event(event.id).unwrap();

        let detected = resolver.sweep().unwrap();
        assert_eq!(detected, 1);

        // Graph snapshot had the higher updated_at, so both stores now
        // carry the graph's name and an advanced timestamp.
        let resolved = store.get_ci(ci.id).unwrap().unwrap();
        assert_eq!(resolved.name, "new-name");
        assert!(resolved.updated_at > t2);
        let node = graph.get_node(ci.id).unwrap().unwrap();
        assert_eq!(node.name, "new-name");

        let (unresolved, total) = store.conflict_counts().unwrap();
        assert_eq!(unresolved, 0);
        assert_eq!(total, 1);
    }

    #[test]
    fn test_relational_wins_overwrites_projection() {
        let (store, graph, resolver) = resolver_with(ConflictStrategy::RelationalWins);
        let t = chrono::Utc::now().timestamp_millis() - 120_000;
        let ci = seed_divergent_ci(&store, &graph, "truth", "stale", t, t + 60_000);
        let event = store.claim_events("w", 10, 60_000).unwrap().remove(0);
        store.complete_event(event.id).unwrap();

        resolver.sweep().unwrap();

        let node = graph.get_node(ci.id).unwrap().unwrap();
        assert_eq!(node.name, "truth");
        assert_eq!(store.conflict_counts().unwrap().0, 0);
    }

    #[test]
    fn test_manual_strategy_leaves_unresolved_and_alerts() {
        let (store, graph, resolver) = resolver_with(ConflictStrategy::Manual);
        let now = chrono::Utc::now().timestamp_millis();
        seed_divergent_ci(&store, &graph, "a", "b", now - 120_000, now - 60_000);
        let event = store.claim_events("w", 10, 60_000).unwrap().remove(0);
        store.complete_event(event.id).unwrap();

        resolver.sweep().unwrap();

        let (unresolved, _) = store.conflict_counts().unwrap();
        assert_eq!(unresolved, 1);
        let alerts = store.active_alerts().unwrap();
        assert!(alerts.iter().any(|a| a.alert_type == "conflict_manual"));
    }

    #[test]
    fn test_missing_in_graph_resolved_by_reprojection() {
        let (store, graph, resolver) = resolver_with(ConflictStrategy::RelationalWins);
        let now = chrono::Utc::now().timestamp_millis();
        let ci = ConfigurationItem {
            id: Uuid::new_v4(),
            name: "lonely".to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec![],
            created_at: now - 10_000,
            updated_at: now - 10_000,
            created_by: Uuid::new_v4(),
            updated_by: Uuid::new_v4(),
        };
        store.create_ci(&ci).unwrap();
        let event = store.claim_events("w", 10, 60_000).unwrap().remove(0);
        store.complete_event(event.id).unwrap();

        let detected = resolver.sweep().unwrap();
        assert_eq!(detected, 1);
        assert!(graph.get_node(ci.id).unwrap().is_some());
    }

    #[test]
    fn test_resolve_by_id_with_override() {
        let (store, graph, resolver) = resolver_with(ConflictStrategy::Manual);
        let now = chrono::Utc::now().timestamp_millis();
        let ci = seed_divergent_ci(&store, &graph, "keep-me", "impostor", now - 60_000, now - 120_000);
        let event = store.claim_events("w", 10, 60_000).unwrap().remove(0);
        store.complete_event(event.id).unwrap();

        resolver.sweep().unwrap();
        let conflicts = store.unresolved_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);

        resolver
            .resolve_by_id(
                conflicts[0].id,
                Some(ConflictStrategy::RelationalWins),
                Uuid::new_v4(),
            )
            .unwrap();
        assert_eq!(store.conflict_counts().unwrap().0, 0);
        assert_eq!(graph.get_node(ci.id).unwrap().unwrap().name, "keep-me");

        // Resolving again is an invalid request.
        let again = resolver.resolve_by_id(conflicts[0].id, None, Uuid::new_v4());
        assert!(matches!(again, Err(SyncError::InvalidRequest(_))));
    }

    #[test]
    fn test_sweep_skips_entities_with_pending_events() {
        let (store, _graph, resolver) = resolver_with(ConflictStrategy::RelationalWins);
        let now = chrono::Utc::now().timestamp_millis();
        let ci = ConfigurationItem {
            id: Uuid::new_v4(),
            name: "in-flight".to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec![],
            created_at: now - 10_000,
            updated_at: now - 10_000,
            created_by: Uuid::new_v4(),
            updated_by: Uuid::new_v4(),
        };
        store.create_ci(&ci).unwrap();
        // The CREATE event is still pending; no conflict should be declared
        // even though the node is absent from the graph.
        assert_eq!(resolver.sweep().unwrap(), 0);
    }
}
