//! Health monitoring, metric aggregation and alerting.
//!
//! A background task snapshots store connectivity, queue depths, conflict
//! totals and pipeline performance every interval, derives an overall
//! status and raises alerts when thresholds are crossed. Alerts carry a TTL
//! and duplicate-suppress per `(severity, type)` while an active one exists.

use crate::config::Config;
use crate::error::Result;
use crate::services::{GraphStore, RedisStore, RelationalStore, RuntimeStats};
use crate::types::{
    Alert, AlertSeverity, ConflictHealth, HealthSnapshot, Metrics, OverallStatus,
    PerformanceHealth, QueueHealth, StoreHealth,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Insert an alert unless an active duplicate exists. Shared by the
/// monitor, the conflict resolver and the fallback controller.
pub fn raise_alert(
    store: &RelationalStore,
    severity: AlertSeverity,
    alert_type: &str,
    message: String,
    data: serde_json::Value,
    ttl_hours: u32,
) -> Result<bool> {
    let now = chrono::Utc::now().timestamp_millis();
    let alert = Alert {
        id: Uuid::new_v4(),
        severity,
        alert_type: alert_type.to_string(),
        message: message.clone(),
        data,
        resolved: false,
        resolved_at: None,
        created_at: now,
        expires_at: now + (ttl_hours as i64) * 3_600_000,
    };
    let created = store.insert_alert(&alert)?;
    if created {
        warn!("Alert [{}] {}: {}", severity.as_str(), alert_type, message);
    }
    Ok(created)
}

/// Periodic health monitor.
pub struct Monitor {
    store: Arc<RelationalStore>,
    graph: Arc<GraphStore>,
    redis: RedisStore,
    config: Arc<Config>,
    stats: Arc<RuntimeStats>,
}

impl Monitor {
    pub fn new(
        store: Arc<RelationalStore>,
        graph: Arc<GraphStore>,
        redis: RedisStore,
        config: Arc<Config>,
        stats: Arc<RuntimeStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            graph,
            redis,
            config,
            stats,
        })
    }

    /// Compute a full health snapshot.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let now = chrono::Utc::now().timestamp_millis();

        let relational = {
            let start = Instant::now();
            match self.store.ping() {
                Ok(()) => StoreHealth {
                    reachable: true,
                    response_ms: start.elapsed().as_millis() as i64,
                    last_checked: now,
                    error: None,
                },
                Err(e) => StoreHealth {
                    reachable: false,
                    response_ms: start.elapsed().as_millis() as i64,
                    last_checked: now,
                    error: Some(e.to_string()),
                },
            }
        };

        let graph = {
            let start = Instant::now();
            match self.graph.ping() {
                Ok(()) => StoreHealth {
                    reachable: true,
                    response_ms: start.elapsed().as_millis() as i64,
                    last_checked: now,
                    error: None,
                },
                Err(e) => StoreHealth {
                    reachable: false,
                    response_ms: start.elapsed().as_millis() as i64,
                    last_checked: now,
                    error: Some(e.to_string()),
                },
            }
        };

        let cache = match tokio::time::timeout(
            Duration::from_millis(self.config.cache_timeout_ms),
            self.redis.ping_ms(),
        )
        .await
        {
            Ok(Some(Ok(ms))) => StoreHealth {
                reachable: true,
                response_ms: ms,
                last_checked: now,
                error: None,
            },
            Ok(Some(Err(e))) => StoreHealth {
                reachable: false,
                response_ms: 0,
                last_checked: now,
                error: Some(e),
            },
            Ok(None) => StoreHealth {
                reachable: false,
                response_ms: 0,
                last_checked: now,
                error: Some("not connected".to_string()),
            },
            Err(_) => StoreHealth {
                reachable: false,
                response_ms: self.config.cache_timeout_ms as i64,
                last_checked: now,
                error: Some("ping deadline exceeded".to_string()),
            },
        };

        let queue = {
            let depths = self.store.queue_depths().unwrap_or_default();
            QueueHealth {
                pending: depths.pending,
                processing: depths.processing,
                failed: depths.failed,
                avg_pending_wait_ms: self.store.avg_pending_wait_ms().unwrap_or(0),
                last_processed: self.store.last_processed_at().unwrap_or(None),
            }
        };

        let conflicts = {
            let (unresolved, total) = self.store.conflict_counts().unwrap_or((0, 0));
            let resolution_rate = if total == 0 {
                1.0
            } else {
                (total - unresolved) as f64 / total as f64
            };
            ConflictHealth {
                unresolved,
                total,
                resolution_rate,
            }
        };

        let performance = {
            let hour_ago = now - 3_600_000;
            let (total, failed, avg_duration) =
                self.store.sync_log_window(hour_ago).unwrap_or((0, 0, 0.0));
            PerformanceHealth {
                avg_sync_duration_ms: avg_duration,
                events_per_minute: total as f64 / 60.0,
                error_rate: if total == 0 {
                    0.0
                } else {
                    failed as f64 / total as f64
                },
            }
        };

        let overall = Self::derive_status(
            &relational,
            &graph,
            &cache,
            &queue,
            &conflicts,
            &performance,
            self.config.backpressure_threshold,
        );

        HealthSnapshot {
            overall,
            relational,
            graph,
            cache,
            queue,
            conflicts,
            performance,
            checked_at: now,
        }
    }

    /// Worst condition wins: unreachable stores or a high error rate are
    /// critical, queue depth and poor resolution are warnings, a missing
    /// cache is a degradation.
    fn derive_status(
        relational: &StoreHealth,
        graph: &StoreHealth,
        cache: &StoreHealth,
        queue: &QueueHealth,
        conflicts: &ConflictHealth,
        performance: &PerformanceHealth,
        backpressure_threshold: usize,
    ) -> OverallStatus {
        if !relational.reachable || !graph.reachable || performance.error_rate > 0.2 {
            return OverallStatus::Critical;
        }
        if queue.pending > 500
            || queue.pending > backpressure_threshold as u64
            || conflicts.resolution_rate < 0.9
        {
            return OverallStatus::Warning;
        }
        if !cache.reachable || conflicts.unresolved > 0 || queue.failed > 0 {
            return OverallStatus::Degraded;
        }
        OverallStatus::Healthy
    }

    /// One monitor pass: snapshot, threshold alerts, alert expiry.
    pub async fn tick(&self) -> Result<HealthSnapshot> {
        let snapshot = self.snapshot().await;
        let ttl = self.config.monitor_alert_ttl_hours;

        if !snapshot.relational.reachable {
            raise_alert(
                &self.store,
                AlertSeverity::Critical,
                "relational_unreachable",
                "relational store is unreachable".to_string(),
                json!({ "error": snapshot.relational.error.clone() }),
                ttl,
            )?;
        }
        if !snapshot.graph.reachable {
            raise_alert(
                &self.store,
                AlertSeverity::Critical,
                "graph_unreachable",
                "graph store is unreachable".to_string(),
                json!({ "error": snapshot.graph.error.clone() }),
                ttl,
            )?;
        }
        if snapshot.performance.error_rate > 0.2 {
            raise_alert(
                &self.store,
                AlertSeverity::Critical,
                "error_rate",
                format!(
                    "sync error rate at {:.0}% over the last hour",
                    snapshot.performance.error_rate * 100.0
                ),
                json!({ "error_rate": snapshot.performance.error_rate }),
                ttl,
            )?;
        }
        if snapshot.queue.pending > self.config.backpressure_threshold as u64 {
            raise_alert(
                &self.store,
                AlertSeverity::Warning,
                "queue_backpressure",
                format!("{} events pending", snapshot.queue.pending),
                json!({ "pending": snapshot.queue.pending }),
                ttl,
            )?;
        } else if snapshot.queue.pending > 500 {
            raise_alert(
                &self.store,
                AlertSeverity::Warning,
                "queue_depth",
                format!("{} events pending", snapshot.queue.pending),
                json!({ "pending": snapshot.queue.pending }),
                ttl,
            )?;
        }
        if snapshot.conflicts.resolution_rate < 0.9 {
            raise_alert(
                &self.store,
                AlertSeverity::Warning,
                "conflict_resolution_rate",
                format!(
                    "conflict resolution rate at {:.0}%",
                    snapshot.conflicts.resolution_rate * 100.0
                ),
                json!({ "unresolved": snapshot.conflicts.unresolved }),
                ttl,
            )?;
        }

        let expired = self.store.expire_alerts()?;
        if expired > 0 {
            debug!("Expired {} alert(s)", expired);
        }
        Ok(snapshot)
    }

    /// Aggregated metrics for the operational surface.
    pub async fn metrics(&self) -> Result<Metrics> {
        Ok(Metrics {
            stats: self.stats.snapshot(),
            health: self.snapshot().await,
            recent_errors: self.store.recent_failed_events(20)?,
            conflicts: self.store.unresolved_conflicts()?,
            recent_events: self.store.recent_events(20)?,
        })
    }

    /// Background monitor loop; exits on shutdown.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval_sec = self.config.monitor_interval_sec;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_sec as u64));
            info!("Monitor loop started (every {} s)", interval_sec);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.tick().await {
                            Ok(snapshot) => {
                                debug!(
                                    "Health: {} (pending={}, failed={}, unresolved={})",
                                    snapshot.overall.as_str(),
                                    snapshot.queue.pending,
                                    snapshot.queue.failed,
                                    snapshot.conflicts.unresolved
                                );
                            }
                            Err(e) => error!("Monitor tick failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Monitor loop stopping");
                        break;
                    }
                }
            }
        });
    }
}
