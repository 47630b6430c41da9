//! Health snapshots, alerts and the aggregated metrics surface.

use crate::types::{ConflictRecord, QueueDepths, SyncEvent, SyncStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Connectivity and latency for one backing store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreHealth {
    pub reachable: bool,
    pub response_ms: i64,
    pub last_checked: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event queue state as seen by the monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueHealth {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub avg_pending_wait_ms: i64,
    pub last_processed: Option<i64>,
}

impl From<QueueDepths> for QueueHealth {
    fn from(depths: QueueDepths) -> Self {
        Self {
            pending: depths.pending,
            processing: depths.processing,
            failed: depths.failed,
            avg_pending_wait_ms: 0,
            last_processed: None,
        }
    }
}

/// Conflict totals and resolution rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictHealth {
    pub unresolved: u64,
    pub total: u64,
    /// Resolved / total, in [0, 1]; 1.0 when no conflicts exist.
    pub resolution_rate: f64,
}

/// Pipeline performance over the last hour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceHealth {
    pub avg_sync_duration_ms: f64,
    pub events_per_minute: f64,
    /// Failed applies / total applies over the last hour, in [0, 1].
    pub error_rate: f64,
}

/// Derived overall status, worst condition wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Warning => "warning",
            OverallStatus::Critical => "critical",
        }
    }
}

/// Structured health snapshot produced by the monitor every interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall: OverallStatus,
    pub relational: StoreHealth,
    pub graph: StoreHealth,
    pub cache: StoreHealth,
    pub queue: QueueHealth,
    pub conflicts: ConflictHealth,
    pub performance: PerformanceHealth,
    pub checked_at: i64,
}

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "error" => Some(AlertSeverity::Error),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

/// An operator-visible alert with a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub data: Value,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Aggregated metrics payload for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub stats: SyncStats,
    pub health: HealthSnapshot,
    pub recent_errors: Vec<SyncEvent>,
    pub conflicts: Vec<ConflictRecord>,
    pub recent_events: Vec<SyncEvent>,
}
