//! Fallback operations: persisted recovery actions for events that
//! exhausted the dispatcher's retry ladder.

use crate::types::{EntityType, SyncAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Recovery strategies, in roughly increasing order of operator involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Reprocess once more through the dispatcher.
    Retry,
    /// Persist and raise an error alert for human action.
    Manual,
    /// Log, raise an info alert, discard.
    Skip,
    /// Persist and drain through the background queue processor.
    Queue,
    /// Re-emit a synthetic UPDATE for every entity in the store of record.
    FullResync,
    /// Reprocess the most recent FAILED events.
    SelectiveResync,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Retry => "retry",
            FallbackStrategy::Manual => "manual",
            FallbackStrategy::Skip => "skip",
            FallbackStrategy::Queue => "queue",
            FallbackStrategy::FullResync => "full_resync",
            FallbackStrategy::SelectiveResync => "selective_resync",
        }
    }

    /// Strategy to try when this one keeps failing for the same event.
    pub fn promoted(&self) -> FallbackStrategy {
        match self {
            FallbackStrategy::Retry => FallbackStrategy::Queue,
            FallbackStrategy::Queue => FallbackStrategy::Manual,
            other => *other,
        }
    }
}

impl FromStr for FallbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(FallbackStrategy::Retry),
            "manual" => Ok(FallbackStrategy::Manual),
            "skip" => Ok(FallbackStrategy::Skip),
            "queue" => Ok(FallbackStrategy::Queue),
            "full_resync" => Ok(FallbackStrategy::FullResync),
            "selective_resync" => Ok(FallbackStrategy::SelectiveResync),
            other => Err(format!("unknown fallback strategy: {}", other)),
        }
    }
}

/// Lifecycle of a persisted fallback operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl FallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStatus::Pending => "pending",
            FallbackStatus::Processing => "processing",
            FallbackStatus::Completed => "completed",
            FallbackStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FallbackStatus::Pending),
            "processing" => Some(FallbackStatus::Processing),
            "completed" => Some(FallbackStatus::Completed),
            "failed" => Some(FallbackStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted recovery action carrying everything needed to replay the
/// original event without re-reading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackOperation {
    pub id: Uuid,
    pub original_event_id: Uuid,
    pub strategy: FallbackStrategy,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: SyncAction,
    pub payload: Value,
    pub retry_count: u32,
    pub status: FallbackStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// Singleton full-resync flag, persisted so the mutex survives restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullResyncStatus {
    pub in_progress: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_report: Option<ResyncReport>,
}

/// Totals reported by a completed resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResyncReport {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_promotion_ladder() {
        assert_eq!(FallbackStrategy::Retry.promoted(), FallbackStrategy::Queue);
        assert_eq!(FallbackStrategy::Queue.promoted(), FallbackStrategy::Manual);
        assert_eq!(FallbackStrategy::Manual.promoted(), FallbackStrategy::Manual);
        assert_eq!(FallbackStrategy::Skip.promoted(), FallbackStrategy::Skip);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "selective_resync".parse::<FallbackStrategy>(),
            Ok(FallbackStrategy::SelectiveResync)
        );
        assert!("requeue".parse::<FallbackStrategy>().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            FallbackStatus::Pending,
            FallbackStatus::Processing,
            FallbackStatus::Completed,
            FallbackStatus::Failed,
        ] {
            assert_eq!(FallbackStatus::parse(status.as_str()), Some(status));
        }
    }
}
