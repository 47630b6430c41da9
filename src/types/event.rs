//! Sync event types: the durable records that carry changes from the
//! relational store of record to the graph projection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Types of entities that flow through the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ConfigurationItem,
    Relationship,
    User,
    Role,
    UserRole,
}

impl EntityType {
    /// Relational table this entity type lives in.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::ConfigurationItem => "configuration_items",
            EntityType::Relationship => "relationships",
            EntityType::User => "users",
            EntityType::Role => "roles",
            EntityType::UserRole => "user_roles",
        }
    }

    /// Stable string form used in table columns and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::ConfigurationItem => "configuration_item",
            EntityType::Relationship => "relationship",
            EntityType::User => "user",
            EntityType::Role => "role",
            EntityType::UserRole => "user_role",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "configuration_item" => Some(EntityType::ConfigurationItem),
            "relationship" => Some(EntityType::Relationship),
            "user" => Some(EntityType::User),
            "role" => Some(EntityType::Role),
            "user_role" => Some(EntityType::UserRole),
            _ => None,
        }
    }

    /// Whether this entity type is projected into the graph store.
    /// Users and roles are captured for auditability but never projected.
    pub fn is_projected(&self) -> bool {
        matches!(
            self,
            EntityType::ConfigurationItem | EntityType::Relationship
        )
    }
}

/// Logical change action carried by a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "CREATE",
            SyncAction::Update => "UPDATE",
            SyncAction::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(SyncAction::Create),
            "UPDATE" => Some(SyncAction::Update),
            "DELETE" => Some(SyncAction::Delete),
            _ => None,
        }
    }
}

/// Event lifecycle. Transitions follow
/// `PENDING -> PROCESSING -> (COMPLETED | FAILED)`; FAILED may return to
/// PENDING only through a fallback requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "PROCESSING" => Some(EventStatus::Processing),
            "COMPLETED" => Some(EventStatus::Completed),
            "FAILED" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// A durable change record emitted by change capture and consumed by the
/// dispatcher. The payload is the full post-image for CREATE/UPDATE and the
/// identifier snapshot for DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: SyncAction,
    pub payload: Value,
    pub status: EventStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Transaction-local sequence; orders events that share a `created_at`.
    pub seq: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    /// Earliest time a FAILED retryable event may return to PENDING.
    pub retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

/// One row per apply attempt, for throughput and latency reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub worker: String,
    pub outcome: String,
    pub duration_ms: i64,
    pub detail: Option<String>,
    pub logged_at: i64,
}

/// Persisted pipeline counters, mirrored by in-memory atomics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub events_processed: u64,
    pub events_failed: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub full_resyncs: u64,
    pub updated_at: i64,
}

/// Pending / processing / failed depths as seen by the monitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueDepths {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serializes_screaming() {
        assert_eq!(
            serde_json::to_value(SyncAction::Create).unwrap(),
            serde_json::json!("CREATE")
        );
        assert_eq!(SyncAction::parse("DELETE"), Some(SyncAction::Delete));
        assert_eq!(SyncAction::parse("delete"), None);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::Failed,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_entity_type_projection() {
        assert!(EntityType::ConfigurationItem.is_projected());
        assert!(EntityType::Relationship.is_projected());
        assert!(!EntityType::User.is_projected());
        assert!(!EntityType::Role.is_projected());
        assert!(!EntityType::UserRole.is_projected());
    }

    #[test]
    fn test_entity_type_table_names() {
        assert_eq!(EntityType::ConfigurationItem.table_name(), "configuration_items");
        assert_eq!(EntityType::UserRole.table_name(), "user_roles");
        assert_eq!(EntityType::parse("configuration_item"), Some(EntityType::ConfigurationItem));
    }
}
