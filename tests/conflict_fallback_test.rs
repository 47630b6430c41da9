//! Integration tests for conflict resolution and the fallback ladder:
//! divergence under the timestamp strategy, the retry ladder into the
//! fallback queue, and full-resync exclusion.

use atlas::services::{CmdbRuntime, GraphNode};
use atlas::types::{ConflictStrategy, ConflictType, EntityType, EventStatus};
use atlas::{Config, SyncError};
use serde_json::json;
use uuid::Uuid;

async fn runtime_with(conflict_strategy: ConflictStrategy) -> CmdbRuntime {
    let mut config = Config::from_env();
    config.db_path = ":memory:".to_string();
    config.redis_url = None;
    config.retry_delay_ms = 0;
    config.retry_limit = 2;
    config.worker_count = 1;
    config.conflict_strategy = conflict_strategy;
    CmdbRuntime::bootstrap(config).await.unwrap()
}

async fn drain(runtime: &CmdbRuntime) {
    while runtime.dispatcher.run_once("worker-0").await.unwrap() > 0 {}
}

#[tokio::test]
async fn test_data_mismatch_under_timestamp_strategy() {
    let runtime = runtime_with(ConflictStrategy::Timestamp).await;
    let actor = Uuid::new_v4();

    let ci = runtime
        .service
        .create_ci(&json!({ "name": "relational-name", "type": "server" }), actor)
        .await
        .unwrap();
    drain(&runtime).await;

    // Seed the projection with a newer, diverging name (t2 > t1).
    let row = runtime.store.get_ci(ci.id).unwrap().unwrap();
    let mut node = GraphNode::from_ci(&row, row.updated_at);
    node.name = "graph-name".to_string();
    node.updated_at = row.updated_at + 60_000;
    runtime.graph.merge_node(node).unwrap();

    let detected = runtime.resolver.sweep().unwrap();
    assert_eq!(detected, 1);

    // The graph snapshot had the higher updated_at: both stores now carry
    // the graph name, and updated_at advanced monotonically.
    let resolved_row = runtime.store.get_ci(ci.id).unwrap().unwrap();
    assert_eq!(resolved_row.name, "graph-name");
    assert!(resolved_row.updated_at > row.updated_at + 60_000);
    let resolved_node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(resolved_node.name, "graph-name");

    let (unresolved, total) = runtime.store.conflict_counts().unwrap();
    assert_eq!(unresolved, 0);
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_concurrent_update_window_yields_single_conflict() {
    let runtime = runtime_with(ConflictStrategy::RelationalWins).await;
    let actor_a = Uuid::new_v4();
    let actor_b = Uuid::new_v4();

    let ci = runtime
        .service
        .create_ci(&json!({ "name": "shared", "type": "server" }), actor_a)
        .await
        .unwrap();
    drain(&runtime).await;

    // Actor B's change reached the projection with a future timestamp,
    // actor A's event is about to apply with an older one.
    let row = runtime.store.get_ci(ci.id).unwrap().unwrap();
    let mut node = GraphNode::from_ci(&row, row.updated_at);
    node.name = "from-actor-b".to_string();
    node.updated_at = row.updated_at + 120_000;
    runtime.graph.merge_node(node).unwrap();

    runtime
        .service
        .update_ci(ci.id, &json!({ "name": "from-actor-a" }), actor_a)
        .await
        .unwrap();
    runtime
        .service
        .update_ci(ci.id, &json!({ "name": "from-actor-a-again" }), actor_b)
        .await
        .unwrap();
    drain(&runtime).await;

    // Exactly one conflict record, resolved by the configured strategy:
    // the relational side wins and the projection follows it.
    let (unresolved, total) = runtime.store.conflict_counts().unwrap();
    assert_eq!(unresolved, 0);
    assert_eq!(total, 1);
    let node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(node.name, "from-actor-a-again");
}

#[tokio::test]
async fn test_conflict_record_snapshots_are_owned_values() {
    let runtime = runtime_with(ConflictStrategy::Manual).await;
    let actor = Uuid::new_v4();
    let ci = runtime
        .service
        .create_ci(&json!({ "name": "original", "type": "server" }), actor)
        .await
        .unwrap();
    drain(&runtime).await;

    let row = runtime.store.get_ci(ci.id).unwrap().unwrap();
    let mut node = GraphNode::from_ci(&row, row.updated_at);
    node.name = "diverged".to_string();
    node.updated_at = row.updated_at + 60_000;
    runtime.graph.merge_node(node).unwrap();

    runtime.resolver.sweep().unwrap();
    let conflicts = runtime.store.unresolved_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::DataMismatch);
    assert_eq!(conflicts[0].relational_snapshot["name"], "original");
    assert_eq!(conflicts[0].graph_snapshot["name"], "diverged");

    // Mutating the live stores afterwards does not touch the snapshots.
    runtime
        .service
        .resolve_conflict(conflicts[0].id, Some(ConflictStrategy::RelationalWins), actor)
        .unwrap();
    let record = runtime.store.get_conflict(conflicts[0].id).unwrap().unwrap();
    assert_eq!(record.relational_snapshot["name"], "original");
    assert!(record.resolved);
    assert!(record.resolved_at.is_some());
}

#[tokio::test]
async fn test_retry_ladder_into_fallback_queue_and_replay() {
    let runtime = runtime_with(ConflictStrategy::RelationalWins).await;
    let actor = Uuid::new_v4();

    let ci = runtime
        .service
        .create_ci(&json!({ "name": "web-01", "type": "server" }), actor)
        .await
        .unwrap();

    // Simulate a graph-store outage across the whole retry ladder.
    runtime.graph.set_available(false);
    for _ in 0..4 {
        runtime.dispatcher.run_once("worker-0").await.unwrap();
    }

    let event = runtime
        .store
        .events_for_entity(EntityType::ConfigurationItem, ci.id)
        .unwrap()
        .remove(0);
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event.retry_count >= 2);

    // Exhaustion reached the fallback controller via polling; a queue
    // operation exists.
    runtime.fallback.poll_unhandled().await.unwrap();
    assert_eq!(runtime.store.pending_fallback_count().unwrap(), 1);

    // Outage ends; the next drain replays the payload successfully.
    runtime.graph.set_available(true);
    let (succeeded, failed) = runtime.fallback.drain_queue().await.unwrap();
    assert_eq!((succeeded, failed), (1, 0));
    assert_eq!(runtime.store.pending_fallback_count().unwrap(), 0);

    let node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(node.name, "web-01");
}

#[tokio::test]
async fn test_full_resync_exclusion() {
    let runtime = runtime_with(ConflictStrategy::RelationalWins).await;
    let actor = Uuid::new_v4();
    for name in ["a", "b", "c"] {
        runtime
            .service
            .create_ci(&json!({ "name": name, "type": "server" }), actor)
            .await
            .unwrap();
    }
    drain(&runtime).await;

    // A resync already holds the singleton flag.
    assert!(runtime.store.try_begin_full_resync().unwrap());
    assert!(runtime.store.full_resync_status().unwrap().in_progress);

    let second = runtime.service.trigger_full_resync().await;
    assert!(matches!(second, Err(SyncError::ResyncInProgress)));

    // Releasing the flag lets the next invocation run to completion.
    runtime
        .store
        .finish_full_resync(&Default::default())
        .unwrap();
    let report = runtime.service.trigger_full_resync().await.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 3);
    assert!(!runtime.store.full_resync_status().unwrap().in_progress);

    // The synthetic events flow through the normal pipeline.
    drain(&runtime).await;
    assert_eq!(runtime.graph.node_count(), 3);
}

#[tokio::test]
async fn test_graceful_degradation_without_schema() {
    let runtime = runtime_with(ConflictStrategy::RelationalWins).await;
    let actor = Uuid::new_v4();

    // No schema registered for this type: the write and the projection
    // both accept the payload as-is.
    let ci = runtime
        .service
        .create_ci(
            &json!({
                "name": "free-form",
                "type": "appliance",
                "attributes": { "anything": { "goes": [1, 2, 3] } }
            }),
            actor,
        )
        .await
        .unwrap();
    drain(&runtime).await;

    let node = runtime.graph.get_node(ci.id).unwrap().unwrap();
    assert_eq!(node.attributes["anything"]["goes"], json!([1, 2, 3]));
}
