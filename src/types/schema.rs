//! User-defined attribute schemas for configuration items and relationships.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Attribute value types a schema may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

/// Recognized string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringFormat {
    Email,
    Ipv4,
    Url,
    Uuid,
}

/// Schema for a single attribute. Constraint fields only apply to the
/// matching value type; others are ignored by the validator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AttributeSchema {
    #[serde(rename = "type")]
    pub attr_type: Option<AttributeType>,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Anchored regular expression applied to the whole string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<StringFormat>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Element schema for arrays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<AttributeSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    /// Nested attribute schemas for objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, AttributeSchema>>,
}

/// A versioned schema for one CI type or relationship type.
/// Versioning is by replacement: registering a schema for an existing type
/// bumps the version and supersedes the previous definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub id: Uuid,
    /// CI type or relationship type this schema constrains.
    pub target_type: String,
    pub version: u32,
    /// Reject attributes not declared in the schema.
    #[serde(default)]
    pub strict: bool,
    pub attributes: BTreeMap<String, AttributeSchema>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A single structured validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub detail: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: &str, detail: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.to_string(),
            detail: detail.into(),
        }
    }
}

/// Outcome of validating a payload against a schema.
/// `errors` is empty exactly when `ok` is true.
#[derive(Debug, Clone)]
pub struct Validation {
    pub ok: bool,
    pub errors: Vec<FieldError>,
    pub normalized: Map<String, Value>,
}

impl Validation {
    pub fn accepted(normalized: Map<String, Value>) -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            normalized,
        }
    }

    pub fn rejected(errors: Vec<FieldError>, normalized: Map<String, Value>) -> Self {
        Self {
            ok: false,
            errors,
            normalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_json_shape() {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "ip".to_string(),
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                required: true,
                format: Some(StringFormat::Ipv4),
                ..Default::default()
            },
        );
        let schema = SchemaDefinition {
            id: Uuid::nil(),
            target_type: "server".to_string(),
            version: 1,
            strict: false,
            attributes,
            created_at: 0,
            updated_at: 0,
        };
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["attributes"]["ip"]["type"], "string");
        assert_eq!(json["attributes"]["ip"]["format"], "ipv4");
        assert_eq!(json["attributes"]["ip"]["required"], true);
    }

    #[test]
    fn test_attribute_schema_deserializes_enum_keyword() {
        let schema: AttributeSchema = serde_json::from_value(serde_json::json!({
            "type": "string",
            "enum": ["dev", "prod"]
        }))
        .unwrap();
        assert_eq!(schema.attr_type, Some(AttributeType::String));
        assert_eq!(schema.enum_values.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_validation_invariant() {
        let validation = Validation::accepted(Map::new());
        assert!(validation.ok);
        assert!(validation.errors.is_empty());

        let validation = Validation::rejected(
            vec![FieldError::new("x", "type", "expected number")],
            Map::new(),
        );
        assert!(!validation.ok);
        assert!(!validation.errors.is_empty());
    }
}
