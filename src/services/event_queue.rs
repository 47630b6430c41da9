//! Durable event queue with a Redis hot-path mirror.
//!
//! The relational `sync_events` table is the source of truth; Redis holds a
//! mirrored copy for low-latency dispatch and loses nothing when it is down.
//! Status transitions go through here so the state machine stays in one
//! place: claim, complete, fail-with-backoff, requeue sweep, cleanup.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::services::{RedisStore, RelationalStore};
use crate::types::{EventStatus, QueueDepths, SyncEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to a failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled to return to PENDING after backoff.
    Retrying { retry_at: i64 },
    /// Retries exhausted or the error was not retryable; the fallback
    /// controller takes over.
    Exhausted,
}

/// Event queue fronting the durable table and the Redis mirror.
pub struct EventQueue {
    store: Arc<RelationalStore>,
    redis: RedisStore,
    config: Arc<Config>,
}

impl EventQueue {
    pub fn new(store: Arc<RelationalStore>, redis: RedisStore, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            store,
            redis,
            config,
        })
    }

    /// Publish a freshly captured event to the mirror. The durable row is
    /// already committed by change capture; this is acceleration only.
    pub async fn record(&self, event: &SyncEvent) {
        debug_assert_eq!(event.status, EventStatus::Pending);
        self.redis.mirror_event(event).await;
        debug!(
            "Recorded {:?} {:?} event {} for {}",
            event.entity_type, event.action, event.id, event.entity_id
        );
    }

    /// Atomically claim a batch of dispatchable events for a worker.
    pub fn claim(&self, worker_id: &str) -> Result<Vec<SyncEvent>> {
        self.store.claim_events(
            worker_id,
            self.config.batch_size,
            (self.config.lease_timeout_sec as i64) * 1_000,
        )
    }

    /// PROCESSING -> COMPLETED; drops the mirrored copy.
    pub async fn complete(&self, event_id: Uuid) -> Result<()> {
        self.store.complete_event(event_id)?;
        self.redis.drop_mirrored_event(event_id).await;
        Ok(())
    }

    /// PROCESSING -> FAILED. Retryable errors below the retry limit are
    /// scheduled back to PENDING after `retry_delay * (retry_count + 1)`,
    /// capped; everything else is terminal here and belongs to fallback.
    pub fn fail(&self, event: &SyncEvent, error: &SyncError) -> Result<FailOutcome> {
        let message = format!("{} ({})", error, error.code());
        if error.retryable() && event.retry_count < self.config.retry_limit {
            let retry_at = chrono::Utc::now().timestamp_millis()
                + self.config.retry_backoff_ms(event.retry_count) as i64;
            self.store.fail_event(event.id, &message, Some(retry_at))?;
            debug!(
                "Event {} failed (attempt {}), retrying at {}",
                event.id,
                event.retry_count + 1,
                retry_at
            );
            Ok(FailOutcome::Retrying { retry_at })
        } else {
            self.store.fail_event(event.id, &message, None)?;
            warn!(
                "Event {} failed terminally after {} attempt(s): {}",
                event.id,
                event.retry_count + 1,
                message
            );
            Ok(FailOutcome::Exhausted)
        }
    }

    /// Sweep FAILED events whose backoff elapsed back to PENDING. A retried
    /// event re-enters at the back of the queue by keeping its original
    /// position ordering but only after newer claims drained.
    pub fn requeue_due_retries(&self) -> Result<usize> {
        self.store.requeue_due_retries()
    }

    /// Explicit requeue used by fallback replays.
    pub fn requeue(&self, event_id: Uuid) -> Result<()> {
        self.store.requeue_event(event_id)
    }

    pub fn depths(&self) -> Result<QueueDepths> {
        self.store.queue_depths()
    }

    /// Fetch an event, preferring the mirror, falling back to the table.
    pub async fn get(&self, event_id: Uuid) -> Result<Option<SyncEvent>> {
        if let Some(event) = self.redis.get_mirrored_event(event_id).await {
            // The mirror may lag status transitions; the durable row wins
            // whenever it is readable.
            if let Some(durable) = self.store.get_event(event_id)? {
                return Ok(Some(durable));
            }
            return Ok(Some(event));
        }
        self.store.get_event(event_id)
    }

    /// Delete COMPLETED events older than the configured horizon.
    pub fn cleanup(&self) -> Result<usize> {
        let horizon_ms = (self.config.event_ttl_days as i64) * 86_400_000;
        self.store.cleanup_completed_events(horizon_ms)
    }

    /// Background cleanup loop; exits on shutdown.
    pub fn start_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval_min = self.config.cleanup_interval_min;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_min as u64 * 60));
            info!("Event cleanup loop started (every {} min)", interval_min);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.cleanup() {
                            Ok(0) => {}
                            Ok(n) => info!("Cleaned up {} completed events", n),
                            Err(e) => error!("Event cleanup failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Event cleanup loop stopping");
                        break;
                    }
                }
            }
        });
    }
}
