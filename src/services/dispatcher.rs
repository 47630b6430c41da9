//! Sync dispatcher: the worker pool that drains the event queue into the
//! graph projection.
//!
//! The apply step is a tagged dispatch table keyed by `(entity_type,
//! action)`; each apply function is pure over the event payload and the
//! store handles, and every graph write is an idempotent merge or a
//! tolerant delete, so at-least-once delivery is harmless. Per-entity
//! advisory locks (Redis when available, in-process otherwise) serialize
//! events for the same entity on top of the claim-order guarantee.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::services::conflict::{ConflictResolver, InlineDecision};
use crate::services::monitor::raise_alert;
use crate::services::schema_validator;
use crate::services::{
    EventQueue, GraphEdge, GraphNode, GraphStore, RedisStore, RelationalStore, RuntimeStats,
};
use crate::types::{
    AlertSeverity, ConfigurationItem, EntityType, Relationship, SyncAction, SyncEvent,
    SyncLogEntry,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the dispatcher-to-fallback error channel. Overflow degrades
/// to database polling on the fallback side.
pub const ERROR_CHANNEL_CAPACITY: usize = 100;

/// How long a worker waits for a contended entity lock before failing the
/// event as retryable.
const LOCK_WAIT_MS: u64 = 2_000;
const LOCK_POLL_MS: u64 = 50;

/// An event whose retries are exhausted, handed to the fallback controller.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: SyncEvent,
    pub error_code: String,
    pub message: String,
}

/// Result of one apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The projection was written.
    Applied,
    /// Nothing to project (non-projected entity type, or an already-absent
    /// delete target).
    NoOp,
    /// The inline conflict check kept the projection; the event completes
    /// without applying.
    SkippedByConflict,
}

impl ApplyOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::NoOp => "noop",
            ApplyOutcome::SkippedByConflict => "conflict_skip",
        }
    }
}

/// Store handles an apply function runs over.
pub struct ApplyContext {
    pub store: Arc<RelationalStore>,
    pub graph: Arc<GraphStore>,
    pub resolver: Arc<ConflictResolver>,
}

pub type ApplyFn = fn(&ApplyContext, &SyncEvent) -> Result<ApplyOutcome>;

/// Tagged dispatch table. Entity types without an entry are not projected
/// and complete as no-ops.
const APPLY_TABLE: &[((EntityType, SyncAction), ApplyFn)] = &[
    (
        (EntityType::ConfigurationItem, SyncAction::Create),
        apply_ci_upsert,
    ),
    (
        (EntityType::ConfigurationItem, SyncAction::Update),
        apply_ci_upsert,
    ),
    (
        (EntityType::ConfigurationItem, SyncAction::Delete),
        apply_ci_delete,
    ),
    (
        (EntityType::Relationship, SyncAction::Create),
        apply_relationship_upsert,
    ),
    (
        (EntityType::Relationship, SyncAction::Update),
        apply_relationship_upsert,
    ),
    (
        (EntityType::Relationship, SyncAction::Delete),
        apply_relationship_delete,
    ),
];

fn lookup_apply(entity_type: EntityType, action: SyncAction) -> Option<ApplyFn> {
    APPLY_TABLE
        .iter()
        .find(|((t, a), _)| *t == entity_type && *a == action)
        .map(|(_, f)| *f)
}

/// Apply one event to the graph projection. Shared by the worker pool and
/// the fallback controller's replays.
pub fn apply_event(ctx: &ApplyContext, event: &SyncEvent) -> Result<ApplyOutcome> {
    match lookup_apply(event.entity_type, event.action) {
        Some(apply) => apply(ctx, event),
        None => Ok(ApplyOutcome::NoOp),
    }
}

/// CI CREATE/UPDATE: validate against the current schema, run the inline
/// conflict check for updates, then MERGE the node.
fn apply_ci_upsert(ctx: &ApplyContext, event: &SyncEvent) -> Result<ApplyOutcome> {
    let mut ci: ConfigurationItem = serde_json::from_value(event.payload.clone())?;

    if let Some(schema) = ctx
        .store
        .get_schema(EntityType::ConfigurationItem, &ci.ci_type)?
    {
        let validation = schema_validator::validate(&ci.attributes, &schema);
        if !validation.ok {
            return Err(SyncError::Validation(validation.errors));
        }
        ci.attributes = validation.normalized;
    }

    if event.action == SyncAction::Update {
        if ctx.resolver.inline_check_ci(&ci)? == InlineDecision::Skip {
            return Ok(ApplyOutcome::SkippedByConflict);
        }
    }

    let now = chrono::Utc::now().timestamp_millis();
    ctx.graph.merge_node(GraphNode::from_ci(&ci, now))?;
    Ok(ApplyOutcome::Applied)
}

/// CI DELETE: DETACH DELETE, tolerant of an already-absent node.
fn apply_ci_delete(ctx: &ApplyContext, event: &SyncEvent) -> Result<ApplyOutcome> {
    let existed = ctx.graph.get_node(event.entity_id)?.is_some();
    ctx.graph.delete_node(event.entity_id)?;
    Ok(if existed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::NoOp
    })
}

/// Relationship CREATE/UPDATE: validate, MATCH both endpoints, MERGE the
/// edge. A missing endpoint is a retryable dependency failure; its event
/// may simply still be in flight.
fn apply_relationship_upsert(ctx: &ApplyContext, event: &SyncEvent) -> Result<ApplyOutcome> {
    let mut rel: Relationship = serde_json::from_value(event.payload.clone())?;

    if let Some(schema) = ctx
        .store
        .get_schema(EntityType::Relationship, &rel.rel_type)?
    {
        let validation = schema_validator::validate(&rel.attributes, &schema);
        if !validation.ok {
            return Err(SyncError::Validation(validation.errors));
        }
        rel.attributes = validation.normalized;
    }

    let now = chrono::Utc::now().timestamp_millis();
    ctx.graph
        .merge_edge(GraphEdge::from_relationship(&rel, now))?;
    Ok(ApplyOutcome::Applied)
}

fn apply_relationship_delete(ctx: &ApplyContext, event: &SyncEvent) -> Result<ApplyOutcome> {
    let existed = ctx.graph.get_edge(event.entity_id)?.is_some();
    ctx.graph.delete_edge(event.entity_id)?;
    Ok(if existed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::NoOp
    })
}

/// The worker pool.
pub struct SyncDispatcher {
    ctx: ApplyContext,
    queue: Arc<EventQueue>,
    redis: RedisStore,
    config: Arc<Config>,
    stats: Arc<RuntimeStats>,
    error_tx: mpsc::Sender<FailedEvent>,
    /// In-process entity locks used when Redis is down.
    local_locks: DashMap<String, String>,
}

impl SyncDispatcher {
    /// Build the dispatcher and hand back the error channel the fallback
    /// controller drains.
    pub fn new(
        store: Arc<RelationalStore>,
        graph: Arc<GraphStore>,
        resolver: Arc<ConflictResolver>,
        queue: Arc<EventQueue>,
        redis: RedisStore,
        config: Arc<Config>,
        stats: Arc<RuntimeStats>,
    ) -> (Arc<Self>, mpsc::Receiver<FailedEvent>) {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                ctx: ApplyContext {
                    store,
                    graph,
                    resolver,
                },
                queue,
                redis,
                config,
                stats,
                error_tx,
                local_locks: DashMap::new(),
            }),
            error_rx,
        )
    }

    pub fn context(&self) -> &ApplyContext {
        &self.ctx
    }

    /// Spawn the worker pool and the retry-requeue sweep.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            "Starting sync dispatcher with {} worker(s)",
            self.config.worker_count
        );

        for index in 0..self.config.worker_count {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                dispatcher
                    .worker_loop(format!("worker-{}", index), shutdown)
                    .await;
            });
        }

        let dispatcher = self.clone();
        let mut sweep_shutdown = shutdown;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(dispatcher.config.poll_interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match dispatcher.queue.requeue_due_retries() {
                            Ok(0) => {}
                            Ok(n) => debug!("Requeued {} event(s) after backoff", n),
                            Err(e) => error!("Retry requeue sweep failed: {}", e),
                        }
                    }
                    _ = sweep_shutdown.changed() => break,
                }
            }
        });
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        info!("{} started", worker_id);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let events = match self.queue.claim(&worker_id) {
                Ok(events) => events,
                Err(e) => {
                    error!("{} failed to claim events: {}", worker_id, e);
                    Vec::new()
                }
            };

            if events.is_empty() {
                // Short poll instead of long-polling the queue.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            for event in events {
                if *shutdown.borrow() {
                    // Abandoned mid-batch; the lease reclaim hands the rest
                    // to another worker.
                    info!("{} abandoning batch on shutdown", worker_id);
                    return;
                }
                self.handle_one(&worker_id, event).await;
            }
        }
        info!("{} stopped", worker_id);
    }

    /// Process one claimed event end to end: lock, apply, transition,
    /// sync-log, stats, error handoff.
    pub async fn handle_one(&self, worker_id: &str, event: SyncEvent) {
        let started = Instant::now();

        if !self
            .acquire_entity_lock(event.entity_type, event.entity_id, worker_id)
            .await
        {
            let busy = SyncError::TransientIo(format!(
                "entity lock busy for {}:{}",
                event.entity_type.as_str(),
                event.entity_id
            ));
            if let Err(e) = self.queue.fail(&event, &busy) {
                error!("Failed to fail event {}: {}", event.id, e);
            }
            return;
        }

        let result = apply_event(&self.ctx, &event);
        self.release_entity_lock(event.entity_type, event.entity_id, worker_id)
            .await;

        let duration_ms = started.elapsed().as_millis() as i64;
        match result {
            Ok(outcome) => {
                if let Err(e) = self.queue.complete(event.id).await {
                    error!("Failed to complete event {}: {}", event.id, e);
                    return;
                }
                self.log_apply(&event, worker_id, outcome.as_str(), duration_ms, None);
                self.stats.record_processed();
                if let Err(e) = self.ctx.store.bump_stats(1, 0, 0, 0, 0) {
                    debug!("Stats flush failed: {}", e);
                }
                debug!(
                    "{} {} {:?} {:?} in {} ms ({})",
                    worker_id,
                    event.id,
                    event.entity_type,
                    event.action,
                    duration_ms,
                    outcome.as_str()
                );
            }
            Err(sync_error) => {
                if let SyncError::Validation(ref errors) = sync_error {
                    let _ = raise_alert(
                        &self.ctx.store,
                        AlertSeverity::Info,
                        "event_validation_failed",
                        format!(
                            "event {} for {:?} {} failed schema validation",
                            event.id, event.entity_type, event.entity_id
                        ),
                        serde_json::json!({ "errors": errors }),
                        self.config.monitor_alert_ttl_hours,
                    );
                }

                self.log_apply(
                    &event,
                    worker_id,
                    "failed",
                    duration_ms,
                    Some(sync_error.to_string()),
                );
                self.stats.record_failed();
                if let Err(e) = self.ctx.store.bump_stats(0, 1, 0, 0, 0) {
                    debug!("Stats flush failed: {}", e);
                }

                match self.queue.fail(&event, &sync_error) {
                    Ok(crate::services::event_queue::FailOutcome::Exhausted) => {
                        self.hand_to_fallback(event, &sync_error);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to fail event {}: {}", event.id, e),
                }
            }
        }
    }

    fn hand_to_fallback(&self, event: SyncEvent, sync_error: &SyncError) {
        let failed = FailedEvent {
            error_code: sync_error.code().to_string(),
            message: sync_error.to_string(),
            event,
        };
        match self.error_tx.try_send(failed) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(failed)) => {
                // Channel saturated; the fallback controller's database
                // poll will find the event.
                warn!(
                    "Error channel full, event {} left for fallback polling",
                    failed.event.id
                );
                let capacity = SyncError::Capacity(format!(
                    "error channel at {} entries",
                    ERROR_CHANNEL_CAPACITY
                ));
                let _ = raise_alert(
                    &self.ctx.store,
                    AlertSeverity::Warning,
                    "error_channel_overflow",
                    capacity.to_string(),
                    capacity.detail(),
                    self.config.monitor_alert_ttl_hours,
                );
            }
            Err(mpsc::error::TrySendError::Closed(failed)) => {
                warn!(
                    "Error channel closed, event {} left for fallback polling",
                    failed.event.id
                );
            }
        }
    }

    fn log_apply(
        &self,
        event: &SyncEvent,
        worker: &str,
        outcome: &str,
        duration_ms: i64,
        detail: Option<String>,
    ) {
        let entry = SyncLogEntry {
            id: Uuid::new_v4(),
            event_id: event.id,
            worker: worker.to_string(),
            outcome: outcome.to_string(),
            duration_ms,
            detail,
            logged_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.ctx.store.append_sync_log(&entry) {
            debug!("Sync log append failed: {}", e);
        }
    }

    /// Advisory lock per entity: Redis when connected, the in-process
    /// table otherwise. Waits briefly on contention, then gives up and
    /// lets the retry ladder reschedule the event.
    async fn acquire_entity_lock(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        worker_id: &str,
    ) -> bool {
        let key = format!("{}:{}", entity_type.as_str(), entity_id);
        let deadline = Instant::now() + Duration::from_millis(LOCK_WAIT_MS);
        loop {
            let acquired = match self
                .redis
                .acquire_entity_lock(entity_type.as_str(), entity_id, worker_id)
                .await
            {
                Some(held) => held,
                None => match self.local_locks.entry(key.clone()) {
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        entry.insert(worker_id.to_string());
                        true
                    }
                    dashmap::mapref::entry::Entry::Occupied(_) => false,
                },
            };
            if acquired {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(LOCK_POLL_MS)).await;
        }
    }

    async fn release_entity_lock(&self, entity_type: EntityType, entity_id: Uuid, worker_id: &str) {
        self.redis
            .release_entity_lock(entity_type.as_str(), entity_id, worker_id)
            .await;
        let key = format!("{}:{}", entity_type.as_str(), entity_id);
        if let Some(entry) = self.local_locks.get(&key) {
            if entry.value() == worker_id {
                drop(entry);
                self.local_locks.remove(&key);
            }
        }
    }

    /// One claim-and-process pass for a single worker id; returns how many
    /// events were handled. Deterministic entry point for tests and drains.
    pub async fn run_once(&self, worker_id: &str) -> Result<usize> {
        self.queue.requeue_due_retries()?;
        let events = self.queue.claim(worker_id)?;
        let count = events.len();
        for event in events {
            self.handle_one(worker_id, event).await;
        }
        Ok(count)
    }
}
