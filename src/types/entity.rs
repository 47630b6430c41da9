//! Core CMDB entities held by the relational store of record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A configuration item: an IT asset with a schema-constrained attribute bag.
///
/// `(name, type)` is unique across the store. Attributes are free-form JSON
/// until a schema is registered for the type, after which writes are
/// validated and normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationItem {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub ci_type: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_by: Uuid,
    pub updated_by: Uuid,
}

/// A typed, directed edge between two distinct configuration items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub created_by: Uuid,
}

/// Minimal user record; authentication itself lives outside the core, but
/// user rows are change-captured like any other entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Role record, change-captured alongside users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
}

/// User-to-role assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_at: i64,
    pub assigned_by: Uuid,
}

/// Append-only audit entry. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub changed_by: Uuid,
    pub changed_at: i64,
    pub details: Value,
}

/// Page of entities plus the unpaginated total, for list queries.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Filters accepted by CI list queries.
#[derive(Debug, Clone, Default)]
pub struct CiFilter {
    pub ci_type: Option<String>,
    pub name_contains: Option<String>,
    pub tag: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Result of a graph traversal from a root CI.
#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub nodes: Vec<ConfigurationItem>,
    pub edges: Vec<Relationship>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_type_serializes_as_type() {
        let ci = ConfigurationItem {
            id: Uuid::nil(),
            name: "web-01".to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec!["prod".to_string()],
            created_at: 0,
            updated_at: 0,
            created_by: Uuid::nil(),
            updated_by: Uuid::nil(),
        };
        let json = serde_json::to_value(&ci).unwrap();
        assert_eq!(json["type"], "server");
        assert!(json.get("ci_type").is_none());
    }

    #[test]
    fn test_ci_round_trip() {
        let mut attributes = Map::new();
        attributes.insert("ip".to_string(), Value::String("10.0.0.1".to_string()));
        let ci = ConfigurationItem {
            id: Uuid::new_v4(),
            name: "db-01".to_string(),
            ci_type: "database".to_string(),
            attributes,
            tags: vec![],
            created_at: 100,
            updated_at: 200,
            created_by: Uuid::new_v4(),
            updated_by: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&ci).unwrap();
        let back: ConfigurationItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, ci.id);
        assert_eq!(back.attributes["ip"], "10.0.0.1");
        assert_eq!(back.updated_at, 200);
    }
}
