use crate::types::{EntityType, FieldError};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the synchronization core.
///
/// Every variant carries a stable machine code and a structured detail
/// payload; free-text is only ever supplementary. The write path surfaces
/// `Validation` and `Capacity` to callers, everything else stays inside the
/// sync pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("payload failed schema validation ({} field error(s))", .0.len())]
    Validation(Vec<FieldError>),

    #[error("dependency missing in graph store: {entity_type:?} {entity_id}")]
    Dependency {
        entity_type: EntityType,
        entity_id: Uuid,
    },

    #[error("transient store failure: {0}")]
    TransientIo(String),

    #[error("permanent store failure: {0}")]
    PermanentIo(String),

    #[error("divergence detected for {entity_type:?} {entity_id}")]
    Conflict {
        entity_type: EntityType,
        entity_id: Uuid,
    },

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("a full resync is already in progress")]
    ResyncInProgress,
}

impl SyncError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation_error",
            SyncError::Dependency { .. } => "dependency_error",
            SyncError::TransientIo(_) => "transient_io_error",
            SyncError::PermanentIo(_) => "permanent_io_error",
            SyncError::Conflict { .. } => "conflict_error",
            SyncError::Capacity(_) => "capacity_error",
            SyncError::NotFound(_) => "not_found",
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::ResyncInProgress => "resync_in_progress",
        }
    }

    /// Whether the dispatcher may retry the failed event.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Dependency { .. } | SyncError::TransientIo(_) | SyncError::Capacity(_)
        )
    }

    /// Structured detail payload for callers and alert data.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            SyncError::Validation(errors) => json!({ "errors": errors }),
            SyncError::Dependency {
                entity_type,
                entity_id,
            } => json!({ "entity_type": entity_type, "entity_id": entity_id }),
            SyncError::Conflict {
                entity_type,
                entity_id,
            } => json!({ "entity_type": entity_type, "entity_id": entity_id }),
            SyncError::TransientIo(msg)
            | SyncError::PermanentIo(msg)
            | SyncError::Capacity(msg)
            | SyncError::NotFound(msg)
            | SyncError::InvalidRequest(msg) => json!({ "message": msg }),
            SyncError::ResyncInProgress => json!({}),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SyncError::PermanentIo(e.to_string())
            }
            _ => SyncError::TransientIo(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        SyncError::TransientIo(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::PermanentIo(format!("payload serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
