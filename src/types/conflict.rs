//! Conflict records and resolution strategies.

use crate::types::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of divergence the resolver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Scalar or attribute values differ between the stores.
    DataMismatch,
    /// Both stores claim to hold the newer state.
    Timestamp,
    /// Relationship endpoints disagree.
    Relationship,
    /// Entity present in one store only.
    Missing,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::DataMismatch => "data_mismatch",
            ConflictType::Timestamp => "timestamp",
            ConflictType::Relationship => "relationship",
            ConflictType::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_mismatch" => Some(ConflictType::DataMismatch),
            "timestamp" => Some(ConflictType::Timestamp),
            "relationship" => Some(ConflictType::Relationship),
            "missing" => Some(ConflictType::Missing),
            _ => None,
        }
    }
}

/// How a detected conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Overwrite the graph projection with the relational snapshot.
    RelationalWins,
    /// Overwrite the relational row with the graph snapshot.
    GraphWins,
    /// Union attribute maps; newer side wins per key, arrays are unioned.
    Merge,
    /// Whole snapshot with the higher `updated_at` wins.
    Timestamp,
    /// No automatic action; a record and an alert are raised.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::RelationalWins => "relational_wins",
            ConflictStrategy::GraphWins => "graph_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Timestamp => "timestamp",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relational_wins" => Ok(ConflictStrategy::RelationalWins),
            "graph_wins" => Ok(ConflictStrategy::GraphWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "timestamp" => Ok(ConflictStrategy::Timestamp),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// A recorded divergence between the two stores for one entity.
///
/// Snapshots are owned JSON values, never references into live entities; at
/// most one unresolved record exists per `(entity_type, entity_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub conflict_type: ConflictType,
    pub relational_snapshot: Value,
    pub graph_snapshot: Value,
    pub strategy: ConflictStrategy,
    pub resolved: bool,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<i64>,
    pub detected_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_round_trip() {
        for strategy in [
            ConflictStrategy::RelationalWins,
            ConflictStrategy::GraphWins,
            ConflictStrategy::Merge,
            ConflictStrategy::Timestamp,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(strategy.as_str().parse::<ConflictStrategy>(), Ok(strategy));
        }
        assert!("primary_wins".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn test_conflict_type_strings() {
        assert_eq!(ConflictType::DataMismatch.as_str(), "data_mismatch");
        assert_eq!(ConflictType::parse("missing"), Some(ConflictType::Missing));
        assert_eq!(ConflictType::parse("bogus"), None);
    }
}
