//! Fallback controller: recovery for events that exhausted the retry
//! ladder.
//!
//! Failures arrive on the dispatcher's bounded error channel, with a
//! database poll behind it for anything the channel dropped. The controller
//! selects a strategy (promoting `retry -> queue -> manual` on repeated
//! failure of the same event), persists fallback operations, drains the
//! queued ones on a schedule via synthetic replays through the apply table,
//! and drives selective and full resyncs. No failed event is lost silently:
//! each one ends reprocessed, in a terminal fallback operation, or as a
//! recorded skip.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::services::conflict::ConflictResolver;
use crate::services::dispatcher::{apply_event, ApplyContext, FailedEvent};
use crate::services::monitor::raise_alert;
use crate::services::{ChangeCapture, EventQueue, GraphStore, RelationalStore, RuntimeStats};
use crate::types::{
    AlertSeverity, EntityType, FallbackOperation, FallbackStatus, FallbackStrategy, ResyncReport,
    SyncEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queued operations drain on this schedule, in batches of this size.
const DRAIN_INTERVAL_SECS: u64 = 300;
const DRAIN_BATCH: usize = 10;

/// How often the database poll sweeps for events the channel dropped.
const POLL_INTERVAL_SECS: u64 = 60;
const POLL_BATCH: usize = 20;

pub struct FallbackController {
    ctx: ApplyContext,
    queue: Arc<EventQueue>,
    capture: Arc<ChangeCapture>,
    config: Arc<Config>,
    stats: Arc<RuntimeStats>,
}

impl FallbackController {
    pub fn new(
        store: Arc<RelationalStore>,
        graph: Arc<GraphStore>,
        resolver: Arc<ConflictResolver>,
        queue: Arc<EventQueue>,
        capture: Arc<ChangeCapture>,
        config: Arc<Config>,
        stats: Arc<RuntimeStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: ApplyContext {
                store,
                graph,
                resolver,
            },
            queue,
            capture,
            config,
            stats,
        })
    }

    fn store(&self) -> &RelationalStore {
        &self.ctx.store
    }

    // ========== Strategy selection and execution ==========

    /// Handle one exhausted event: pick a strategy (promoted once per prior
    /// terminal failure of the same event) and execute it.
    pub async fn handle_failed(&self, failed: &FailedEvent) -> Result<()> {
        let prior_failures = self.store().fallback_failures_for_event(failed.event.id)?;
        let mut strategy = self.config.fallback_strategy;
        for _ in 0..prior_failures {
            strategy = strategy.promoted();
        }
        info!(
            "Fallback for event {} ({}): strategy {}{}",
            failed.event.id,
            failed.error_code,
            strategy.as_str(),
            if prior_failures > 0 {
                format!(" (promoted after {} failure(s))", prior_failures)
            } else {
                String::new()
            }
        );

        match strategy {
            FallbackStrategy::Retry => self.execute_retry(failed),
            FallbackStrategy::Queue => self.execute_queue(failed),
            FallbackStrategy::Manual => self.execute_manual(failed),
            FallbackStrategy::Skip => self.execute_skip(failed),
            FallbackStrategy::FullResync => match self.trigger_full_resync().await {
                Err(SyncError::ResyncInProgress) => {
                    debug!("Full resync already running, queueing event instead");
                    self.execute_queue(failed)
                }
                Err(e) => Err(e),
                Ok(report) => {
                    self.record_operation(
                        failed,
                        FallbackStrategy::FullResync,
                        FallbackStatus::Completed,
                    )?;
                    info!(
                        "Full resync for event {}: {}/{} succeeded in {} ms",
                        failed.event.id, report.succeeded, report.total, report.duration_ms
                    );
                    Ok(())
                }
            },
            FallbackStrategy::SelectiveResync => {
                let requeued = self.selective_resync()?;
                self.record_operation(
                    failed,
                    FallbackStrategy::SelectiveResync,
                    FallbackStatus::Completed,
                )?;
                info!(
                    "Selective resync for event {} requeued {} event(s)",
                    failed.event.id, requeued
                );
                Ok(())
            }
        }
    }

    fn operation_from(
        failed: &FailedEvent,
        strategy: FallbackStrategy,
        status: FallbackStatus,
    ) -> FallbackOperation {
        let now = chrono::Utc::now().timestamp_millis();
        FallbackOperation {
            id: Uuid::new_v4(),
            original_event_id: failed.event.id,
            strategy,
            entity_type: failed.event.entity_type,
            entity_id: failed.event.entity_id,
            action: failed.event.action,
            payload: failed.event.payload.clone(),
            retry_count: 0,
            status,
            created_at: now,
            started_at: None,
            completed_at: if status == FallbackStatus::Completed {
                Some(now)
            } else {
                None
            },
            error: Some(failed.message.clone()),
        }
    }

    fn record_operation(
        &self,
        failed: &FailedEvent,
        strategy: FallbackStrategy,
        status: FallbackStatus,
    ) -> Result<FallbackOperation> {
        let op = Self::operation_from(failed, strategy, status);
        self.store().insert_fallback_operation(&op)?;
        Ok(op)
    }

    /// `retry`: put the event straight back in the dispatcher's queue.
    fn execute_retry(&self, failed: &FailedEvent) -> Result<()> {
        let op = self.record_operation(failed, FallbackStrategy::Retry, FallbackStatus::Completed)?;
        self.queue.requeue(failed.event.id)?;
        self.store()
            .append_fallback_log(op.id, "requeued for one more dispatch pass")?;
        Ok(())
    }

    /// `queue`: persist for the background drain.
    fn execute_queue(&self, failed: &FailedEvent) -> Result<()> {
        let op = self.record_operation(failed, FallbackStrategy::Queue, FallbackStatus::Pending)?;
        self.store().append_fallback_log(op.id, "queued for replay")?;

        let pending = self.store().pending_fallback_count()?;
        if pending > self.config.fallback_queue_threshold as u64 {
            raise_alert(
                self.store(),
                AlertSeverity::Warning,
                "fallback_queue_depth",
                format!("{} fallback operations pending", pending),
                json!({ "pending": pending }),
                self.config.monitor_alert_ttl_hours,
            )?;
        }
        Ok(())
    }

    /// `manual`: persist and page a human.
    fn execute_manual(&self, failed: &FailedEvent) -> Result<()> {
        let op = self.record_operation(failed, FallbackStrategy::Manual, FallbackStatus::Pending)?;
        self.store()
            .append_fallback_log(op.id, "awaiting manual action")?;
        raise_alert(
            self.store(),
            AlertSeverity::Error,
            "fallback_manual",
            format!(
                "event {} for {:?} {} needs manual recovery: {}",
                failed.event.id, failed.event.entity_type, failed.event.entity_id, failed.message
            ),
            json!({ "operation_id": op.id, "event_id": failed.event.id }),
            self.config.monitor_alert_ttl_hours,
        )?;
        Ok(())
    }

    /// `skip`: log, alert at info, discard — but leave a record.
    fn execute_skip(&self, failed: &FailedEvent) -> Result<()> {
        let op = self.record_operation(failed, FallbackStrategy::Skip, FallbackStatus::Completed)?;
        self.store()
            .append_fallback_log(op.id, "skipped by configured strategy")?;
        warn!(
            "Skipping event {} for {:?} {} ({})",
            failed.event.id, failed.event.entity_type, failed.event.entity_id, failed.message
        );
        raise_alert(
            self.store(),
            AlertSeverity::Info,
            "fallback_skip",
            format!("event {} skipped after exhausted retries", failed.event.id),
            json!({ "event_id": failed.event.id }),
            self.config.monitor_alert_ttl_hours,
        )?;
        Ok(())
    }

    // ========== Queue drain ==========

    /// Drain one batch of pending operations by replaying each payload
    /// through the apply table. Returns (succeeded, failed).
    pub async fn drain_queue(&self) -> Result<(usize, usize)> {
        let ops = self.store().claim_fallback_operations(DRAIN_BATCH)?;
        if ops.is_empty() {
            return Ok((0, 0));
        }
        info!("Draining {} fallback operation(s)", ops.len());

        let mut succeeded = 0;
        let mut failed = 0;
        for op in ops {
            let event = Self::synthetic_event(&op);
            match apply_event(&self.ctx, &event) {
                Ok(_) => {
                    self.store().finish_fallback_operation(
                        op.id,
                        FallbackStatus::Completed,
                        None,
                    )?;
                    self.store()
                        .append_fallback_log(op.id, "replay applied to graph store")?;
                    succeeded += 1;
                }
                Err(e) => {
                    failed += 1;
                    if op.retry_count < self.config.retry_limit {
                        self.store().finish_fallback_operation(
                            op.id,
                            FallbackStatus::Failed,
                            Some(&e.to_string()),
                        )?;
                        self.store().requeue_fallback_operation(op.id)?;
                        self.store().append_fallback_log(
                            op.id,
                            &format!("replay failed, will retry: {}", e),
                        )?;
                    } else {
                        self.store().finish_fallback_operation(
                            op.id,
                            FallbackStatus::Failed,
                            Some(&e.to_string()),
                        )?;
                        self.store()
                            .append_fallback_log(op.id, "replay failed terminally, promoting")?;
                        // Promote to manual so the failure is never silent.
                        let synthetic = FailedEvent {
                            event,
                            error_code: e.code().to_string(),
                            message: e.to_string(),
                        };
                        self.execute_manual(&synthetic)?;
                    }
                }
            }
        }
        Ok((succeeded, failed))
    }

    /// Rebuild a dispatchable event from a persisted operation.
    fn synthetic_event(op: &FallbackOperation) -> SyncEvent {
        let now = chrono::Utc::now().timestamp_millis();
        SyncEvent {
            id: op.original_event_id,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            action: op.action,
            payload: op.payload.clone(),
            status: crate::types::EventStatus::Processing,
            retry_count: op.retry_count,
            last_error: op.error.clone(),
            seq: 0,
            claimed_by: None,
            claimed_at: Some(now),
            retry_at: None,
            created_at: op.created_at,
            updated_at: now,
            processed_at: None,
        }
    }

    // ========== Resyncs ==========

    /// Re-emit a synthetic UPDATE for every CI, relationship, user and role
    /// in the store of record. Guarded by the persisted singleton flag so
    /// at most one full resync runs at a time.
    pub async fn trigger_full_resync(&self) -> Result<ResyncReport> {
        if !self.store().try_begin_full_resync()? {
            return Err(SyncError::ResyncInProgress);
        }
        let started = std::time::Instant::now();
        info!("Full resync started");

        let mut report = ResyncReport::default();
        let batches: Vec<(EntityType, Vec<Uuid>)> = vec![
            (EntityType::ConfigurationItem, self.store().ci_ids()?),
            (EntityType::Relationship, self.store().relationship_ids()?),
            (EntityType::User, self.store().user_ids()?),
            (EntityType::Role, self.store().role_ids()?),
        ];

        for (entity_type, ids) in batches {
            for id in ids {
                report.total += 1;
                match self.capture.force_sync(entity_type, id).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            "Full resync failed to emit event for {:?} {}: {}",
                            entity_type, id, e
                        );
                    }
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as i64;
        self.store().finish_full_resync(&report)?;
        self.stats.record_full_resync();
        self.store().bump_stats(0, 0, 0, 0, 1)?;
        info!(
            "Full resync finished: {}/{} emitted, {} failed, {} ms",
            report.succeeded, report.total, report.failed, report.duration_ms
        );
        Ok(report)
    }

    /// Requeue the most recent FAILED events for another dispatch pass.
    pub fn selective_resync(&self) -> Result<usize> {
        let events = self
            .store()
            .recent_failed_events(self.config.fallback_selective_limit)?;
        let mut requeued = 0;
        for event in events {
            match self.queue.requeue(event.id) {
                Ok(()) => requeued += 1,
                Err(e) => debug!("Selective resync skipped event {}: {}", event.id, e),
            }
        }
        info!("Selective resync requeued {} event(s)", requeued);
        Ok(requeued)
    }

    // ========== Background tasks ==========

    /// Spawn the error-channel consumer, the queue drain loop and the
    /// database poll.
    pub fn start(
        self: Arc<Self>,
        mut error_rx: mpsc::Receiver<FailedEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let controller = self.clone();
        let mut consumer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!("Fallback error consumer started");
            loop {
                tokio::select! {
                    failed = error_rx.recv() => {
                        match failed {
                            Some(failed) => {
                                if let Err(e) = controller.handle_failed(&failed).await {
                                    error!(
                                        "Fallback handling failed for event {}: {}",
                                        failed.event.id, e
                                    );
                                }
                            }
                            None => break,
                        }
                    }
                    _ = consumer_shutdown.changed() => break,
                }
            }
            info!("Fallback error consumer stopped");
        });

        let controller = self.clone();
        let mut drain_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(DRAIN_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match controller.drain_queue().await {
                            Ok((0, 0)) => {}
                            Ok((succeeded, failed)) => {
                                info!("Fallback drain: {} replayed, {} failed", succeeded, failed);
                            }
                            Err(e) => error!("Fallback drain failed: {}", e),
                        }
                    }
                    _ = drain_shutdown.changed() => break,
                }
            }
        });

        let controller = self;
        let mut poll_shutdown = shutdown;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = controller.poll_unhandled().await {
                            error!("Fallback poll failed: {}", e);
                        }
                    }
                    _ = poll_shutdown.changed() => break,
                }
            }
        });
    }

    /// Pick up exhausted events the channel never delivered.
    pub async fn poll_unhandled(&self) -> Result<usize> {
        let events = self.store().unhandled_exhausted_events(POLL_BATCH)?;
        let count = events.len();
        for event in events {
            let failed = FailedEvent {
                error_code: "transient_io_error".to_string(),
                message: event
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retries exhausted".to_string()),
                event,
            };
            self.handle_failed(&failed).await?;
        }
        if count > 0 {
            info!("Fallback poll handled {} unclaimed failure(s)", count);
        }
        Ok(count)
    }
}
