//! End-to-end tests for the capture -> queue -> dispatch -> projection
//! pipeline, using in-memory stores and a deterministic worker drain.

use atlas::services::CmdbRuntime;
use atlas::types::{EntityType, EventStatus, SyncAction};
use atlas::{Config, SyncError, WriteRequest};
use serde_json::json;
use uuid::Uuid;

async fn runtime() -> CmdbRuntime {
    let mut config = Config::from_env();
    config.db_path = ":memory:".to_string();
    config.redis_url = None;
    config.retry_delay_ms = 0;
    config.worker_count = 1;
    CmdbRuntime::bootstrap(config).await.unwrap()
}

async fn drain(runtime: &CmdbRuntime) {
    while runtime.dispatcher.run_once("worker-0").await.unwrap() > 0 {}
}

#[tokio::test]
async fn test_create_then_project() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();
    let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();

    runtime
        .service
        .write(WriteRequest {
            operation: SyncAction::Create,
            entity_type: EntityType::ConfigurationItem,
            entity_id: None,
            payload: json!({
                "id": id.to_string(),
                "name": "web-01",
                "type": "server",
                "attributes": { "ip": "10.0.0.1" },
                "tags": ["prod"]
            }),
            actor_id: actor,
        })
        .await
        .unwrap();

    // The event is durable and PENDING before any worker runs.
    let events = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, id)
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Pending);
    assert_eq!(events[0].action, SyncAction::Create);

    drain(&runtime).await;

    let node = runtime.graph.get_node(id).unwrap().unwrap();
    assert_eq!(node.name, "web-01");
    assert_eq!(node.ci_type, "server");
    assert_eq!(node.attributes["ip"], "10.0.0.1");
    assert_eq!(node.tags, vec!["prod".to_string()]);

    let events = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, id)
        .unwrap();
    assert_eq!(events[0].status, EventStatus::Completed);
}

#[tokio::test]
async fn test_projection_matches_relational_after_quiescence() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();

    let ci = runtime
        .service
        .create_ci(
            &json!({
                "name": "db-01",
                "type": "database",
                "attributes": { "engine": "postgres", "port": 5432 },
                "tags": ["prod", "primary"]
            }),
            actor,
        )
        .await
        .unwrap();
    drain(&runtime).await;

    let row = runtime.store.get_ci(ci.id).unwrap().unwrap();
    let node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(node.name, row.name);
    assert_eq!(node.ci_type, row.ci_type);
    assert_eq!(node.attributes, row.attributes);
    assert_eq!(node.tags, row.tags);
    assert!((node.updated_at - row.updated_at).abs() <= 5_000);
}

#[tokio::test]
async fn test_idempotent_replay() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();
    let ci = runtime
        .service
        .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
        .await
        .unwrap();
    drain(&runtime).await;

    let events = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, ci.id)
        .unwrap();
    let completed = events[0].clone();
    let before = runtime.graph.get_node(ci.id).unwrap().unwrap();

    // Replaying the completed event leaves the projection unchanged.
    atlas::services::apply_event(runtime.dispatcher.context(), &completed).unwrap();
    let after = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(before.name, after.name);
    assert_eq!(before.attributes, after.attributes);
    assert_eq!(runtime.graph.node_count(), 1);
}

#[tokio::test]
async fn test_relationship_endpoint_in_flight() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();

    let a = runtime
        .service
        .create_ci(&json!({ "name": "a", "type": "server" }), actor)
        .await
        .unwrap();
    drain(&runtime).await;

    // B exists in the relational store but its event is still pending when
    // we apply the relationship out of band.
    let b = runtime
        .service
        .create_ci(&json!({ "name": "b", "type": "server" }), actor)
        .await
        .unwrap();
    let rel = runtime
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

    let rel_event = runtime
        .store
        .events_for_entity(EntityType::Relationship, rel.id)
        .unwrap()
        .remove(0);
    let result = atlas::services::apply_event(runtime.dispatcher.context(), &rel_event);
    assert!(matches!(result, Err(SyncError::Dependency { .. })));

    // The normal drain projects B first, then the edge merges on retry.
    drain(&runtime).await;
    assert_eq!(runtime.graph.edge_count(), 1);
    let edge = runtime.graph.get_edge(rel.id).unwrap().unwrap();
    assert_eq!(edge.source_id, a.id);
    assert_eq!(edge.target_id, b.id);
}

#[tokio::test]
async fn test_relationship_create_then_delete_leaves_no_edges() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();
    let a = runtime
        .service
        .create_ci(&json!({ "name": "a", "type": "server" }), actor)
        .await
        .unwrap();
    let b = runtime
        .service
        .create_ci(&json!({ "name": "b", "type": "server" }), actor)
        .await
        .unwrap();
    let rel = runtime
        .service
        .create_relationship(
            &json!({
                "type": "CONNECTS_TO",
                "source_id": a.id.to_string(),
                "target_id": b.id.to_string()
            }),
            actor,
        )
        .await
        .unwrap();
    drain(&runtime).await;
    assert_eq!(runtime.graph.edge_count(), 1);

    runtime
        .service
        .delete_relationship(rel.id, actor)
        .await
        .unwrap();
    drain(&runtime).await;
    assert_eq!(runtime.graph.edge_count(), 0);
    assert_eq!(runtime.graph.node_count(), 2);
}

#[tokio::test]
async fn test_per_entity_ordering_under_rapid_updates() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();
    let ci = runtime
        .service
        .create_ci(&json!({ "name": "step-0", "type": "server" }), actor)
        .await
        .unwrap();

    for step in 1..=5 {
        runtime
            .service
            .update_ci(ci.id, &json!({ "name": format!("step-{}", step) }), actor)
            .await
            .unwrap();
    }
    drain(&runtime).await;

    // Events applied in commit order: the last write wins in the graph.
    let node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(node.name, "step-5");

    let events = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, ci.id)
        .unwrap();
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.status == EventStatus::Completed));
}

#[tokio::test]
async fn test_exactly_one_event_per_write() {
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
    runtime.service.delete_ci(ci.id, actor, false).await.unwrap();

    let events = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, ci.id)
        .unwrap();
    let actions: Vec<SyncAction> = events.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![SyncAction::Create, SyncAction::Update, SyncAction::Delete]
    );

    drain(&runtime).await;
    assert_eq!(runtime.graph.node_count(), 0);
}

#[tokio::test]
async fn test_rejected_write_captures_nothing() {
    let runtime = runtime().await;
    let actor = Uuid::new_v4();
    runtime
        .service
        .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
        .await
        .unwrap();

    // Duplicate (name, type) aborts the transaction, including capture.
    let result = runtime
        .service
        .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
        .await;
    assert!(result.is_err());

    let depths = runtime.store.queue_depths().unwrap();
    assert_eq!(depths.pending, 1);
}
