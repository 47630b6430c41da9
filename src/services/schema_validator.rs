//! Schema validator for flexible, user-defined attribute schemas.
//!
//! Given an attribute payload and a schema definition, decides acceptance and
//! produces a normalized payload: defaults filled in, unambiguous numeric
//! strings coerced, dates canonicalized to RFC 3339 UTC. The validator never
//! panics and reports failures only as structured field errors; callers
//! decide whether to reject the write.

use crate::types::{
    AttributeSchema, AttributeType, FieldError, SchemaDefinition, StringFormat, Validation,
};
use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Validate `payload` against `schema`, returning the outcome and the
/// normalized payload. A payload for a type with no registered schema should
/// not reach this function; callers accept those as-is.
pub fn validate(payload: &Map<String, Value>, schema: &SchemaDefinition) -> Validation {
    let mut errors = Vec::new();
    let mut normalized = Map::new();

    for (name, attr) in &schema.attributes {
        match payload.get(name) {
            Some(value) => {
                let checked = check_value(name, value, attr, &mut errors);
                normalized.insert(name.clone(), checked);
            }
            None => {
                if let Some(default) = &attr.default {
                    normalized.insert(name.clone(), default.clone());
                } else if attr.required {
                    errors.push(FieldError::new(
                        name.clone(),
                        "required",
                        "missing required attribute",
                    ));
                }
            }
        }
    }

    // Unknown fields pass through unchanged unless the schema is strict.
    for (name, value) in payload {
        if schema.attributes.contains_key(name) {
            continue;
        }
        if schema.strict {
            errors.push(FieldError::new(
                name.clone(),
                "unknown_field",
                "attribute not declared in strict schema",
            ));
        } else {
            normalized.insert(name.clone(), value.clone());
        }
    }

    if errors.is_empty() {
        Validation::accepted(normalized)
    } else {
        Validation::rejected(errors, normalized)
    }
}

/// Check one value against one attribute schema, recursing into arrays and
/// objects. Returns the (possibly coerced) value for the normalized payload.
fn check_value(
    field: &str,
    value: &Value,
    attr: &AttributeSchema,
    errors: &mut Vec<FieldError>,
) -> Value {
    let Some(attr_type) = attr.attr_type else {
        // Untyped attribute: only enum membership can be checked.
        check_enum(field, value, attr, errors);
        return value.clone();
    };

    match attr_type {
        AttributeType::String => check_string(field, value, attr, errors),
        AttributeType::Number => check_number(field, value, attr, errors),
        AttributeType::Boolean => check_boolean(field, value, errors),
        AttributeType::Date => check_date(field, value, errors),
        AttributeType::Array => check_array(field, value, attr, errors),
        AttributeType::Object => check_object(field, value, attr, errors),
    }
}

fn check_string(
    field: &str,
    value: &Value,
    attr: &AttributeSchema,
    errors: &mut Vec<FieldError>,
) -> Value {
    let Value::String(s) = value else {
        errors.push(FieldError::new(field, "type", "expected string"));
        return value.clone();
    };

    if let Some(min) = attr.min_length {
        if s.chars().count() < min {
            errors.push(FieldError::new(
                field,
                "min_length",
                format!("shorter than {} characters", min),
            ));
        }
    }
    if let Some(max) = attr.max_length {
        if s.chars().count() > max {
            errors.push(FieldError::new(
                field,
                "max_length",
                format!("longer than {} characters", max),
            ));
        }
    }
    if let Some(pattern) = &attr.pattern {
        match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(re) => {
                if !re.is_match(s) {
                    errors.push(FieldError::new(
                        field,
                        "pattern",
                        format!("does not match pattern {}", pattern),
                    ));
                }
            }
            Err(_) => {
                errors.push(FieldError::new(
                    field,
                    "pattern",
                    "schema pattern is not a valid regular expression",
                ));
            }
        }
    }
    if let Some(format) = attr.format {
        if !format_matches(format, s) {
            errors.push(FieldError::new(
                field,
                "format",
                format!("expected {} format", format_name(format)),
            ));
        }
    }
    check_enum(field, value, attr, errors);
    value.clone()
}

fn format_matches(format: StringFormat, s: &str) -> bool {
    match format {
        StringFormat::Email => {
            // One '@', non-empty local part, dotted domain.
            let Some((local, domain)) = s.split_once('@') else {
                return false;
            };
            !local.is_empty()
                && !domain.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !s.contains(char::is_whitespace)
        }
        StringFormat::Ipv4 => s.parse::<std::net::Ipv4Addr>().is_ok(),
        StringFormat::Url => Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$")
            .map(|re| re.is_match(s))
            .unwrap_or(false),
        StringFormat::Uuid => Uuid::parse_str(s).is_ok(),
    }
}

fn format_name(format: StringFormat) -> &'static str {
    match format {
        StringFormat::Email => "email",
        StringFormat::Ipv4 => "ipv4",
        StringFormat::Url => "url",
        StringFormat::Uuid => "uuid",
    }
}

fn check_number(
    field: &str,
    value: &Value,
    attr: &AttributeSchema,
    errors: &mut Vec<FieldError>,
) -> Value {
    // Unambiguous numeric strings are coerced into numbers.
    let coerced = match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() && !s.trim().is_empty() => {
                Number::from_f64(n).map(Value::Number).unwrap_or_else(|| value.clone())
            }
            _ => {
                errors.push(FieldError::new(field, "type", "expected number"));
                return value.clone();
            }
        },
        _ => {
            errors.push(FieldError::new(field, "type", "expected number"));
            return value.clone();
        }
    };

    let Some(n) = coerced.as_f64() else {
        errors.push(FieldError::new(field, "type", "expected number"));
        return coerced;
    };

    if let Some(min) = attr.min {
        if n < min {
            errors.push(FieldError::new(field, "min", format!("below minimum {}", min)));
        }
    }
    if let Some(max) = attr.max {
        if n > max {
            errors.push(FieldError::new(field, "max", format!("above maximum {}", max)));
        }
    }
    if let Some(step) = attr.multiple_of {
        if step > 0.0 {
            let ratio = n / step;
            if (ratio - ratio.round()).abs() > 1e-9 {
                errors.push(FieldError::new(
                    field,
                    "multiple_of",
                    format!("not a multiple of {}", step),
                ));
            }
        }
    }
    check_enum(field, &coerced, attr, errors);
    coerced
}

fn check_boolean(field: &str, value: &Value, errors: &mut Vec<FieldError>) -> Value {
    if !value.is_boolean() {
        errors.push(FieldError::new(field, "type", "expected boolean"));
    }
    value.clone()
}

fn check_date(field: &str, value: &Value, errors: &mut Vec<FieldError>) -> Value {
    let Value::String(s) = value else {
        errors.push(FieldError::new(field, "type", "expected date string"));
        return value.clone();
    };

    // Naive dates are rejected: the offset must be explicit.
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Value::String(
            dt.with_timezone(&chrono::Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Err(_) => {
            errors.push(FieldError::new(
                field,
                "date",
                "expected RFC 3339 instant with timezone",
            ));
            value.clone()
        }
    }
}

fn check_array(
    field: &str,
    value: &Value,
    attr: &AttributeSchema,
    errors: &mut Vec<FieldError>,
) -> Value {
    let Value::Array(items) = value else {
        errors.push(FieldError::new(field, "type", "expected array"));
        return value.clone();
    };

    if let Some(min) = attr.min_items {
        if items.len() < min {
            errors.push(FieldError::new(
                field,
                "min_items",
                format!("fewer than {} items", min),
            ));
        }
    }
    if let Some(max) = attr.max_items {
        if items.len() > max {
            errors.push(FieldError::new(
                field,
                "max_items",
                format!("more than {} items", max),
            ));
        }
    }

    let checked: Vec<Value> = match &attr.items {
        Some(item_schema) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                check_value(&format!("{}[{}]", field, i), item, item_schema, errors)
            })
            .collect(),
        None => items.clone(),
    };
    Value::Array(checked)
}

fn check_object(
    field: &str,
    value: &Value,
    attr: &AttributeSchema,
    errors: &mut Vec<FieldError>,
) -> Value {
    let Value::Object(map) = value else {
        errors.push(FieldError::new(field, "type", "expected object"));
        return value.clone();
    };

    let Some(properties) = &attr.properties else {
        return value.clone();
    };

    let mut checked = Map::new();
    for (name, prop_schema) in properties {
        let path = format!("{}.{}", field, name);
        match map.get(name) {
            Some(inner) => {
                checked.insert(name.clone(), check_value(&path, inner, prop_schema, errors));
            }
            None => {
                if let Some(default) = &prop_schema.default {
                    checked.insert(name.clone(), default.clone());
                } else if prop_schema.required {
                    errors.push(FieldError::new(path, "required", "missing required attribute"));
                }
            }
        }
    }
    for (name, inner) in map {
        if !properties.contains_key(name) {
            checked.insert(name.clone(), inner.clone());
        }
    }
    Value::Object(checked)
}

fn check_enum(field: &str, value: &Value, attr: &AttributeSchema, errors: &mut Vec<FieldError>) {
    if let Some(allowed) = &attr.enum_values {
        if !allowed.contains(value) {
            errors.push(FieldError::new(
                field,
                "enum",
                "value not in the allowed set",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema_with(attributes: Vec<(&str, AttributeSchema)>) -> SchemaDefinition {
        SchemaDefinition {
            id: Uuid::nil(),
            target_type: "server".to_string(),
            version: 1,
            strict: false,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_required_field_missing() {
        let schema = schema_with(vec![(
            "ip",
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                required: true,
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({})), &schema);
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "required");
        assert_eq!(result.errors[0].field, "ip");
    }

    #[test]
    fn test_default_applied_for_missing_optional() {
        let schema = schema_with(vec![(
            "environment",
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                default: Some(json!("production")),
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({})), &schema);
        assert!(result.ok);
        assert_eq!(result.normalized["environment"], "production");
    }

    #[test]
    fn test_numeric_string_coerced() {
        let schema = schema_with(vec![(
            "cpu_count",
            AttributeSchema {
                attr_type: Some(AttributeType::Number),
                min: Some(1.0),
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({ "cpu_count": "8" })), &schema);
        assert!(result.ok, "errors: {:?}", result.errors);
        assert_eq!(result.normalized["cpu_count"], json!(8.0));
    }

    #[test]
    fn test_ambiguous_numeric_string_rejected() {
        let schema = schema_with(vec![(
            "cpu_count",
            AttributeSchema {
                attr_type: Some(AttributeType::Number),
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({ "cpu_count": "8 cores" })), &schema);
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "type");
    }

    #[test]
    fn test_number_bounds_inclusive() {
        let schema = schema_with(vec![(
            "load",
            AttributeSchema {
                attr_type: Some(AttributeType::Number),
                min: Some(0.0),
                max: Some(1.0),
                ..Default::default()
            },
        )]);
        assert!(validate(&payload(json!({ "load": 1.0 })), &schema).ok);
        assert!(validate(&payload(json!({ "load": 0.0 })), &schema).ok);
        let over = validate(&payload(json!({ "load": 1.5 })), &schema);
        assert_eq!(over.errors[0].code, "max");
    }

    #[test]
    fn test_multiple_of() {
        let schema = schema_with(vec![(
            "memory_gb",
            AttributeSchema {
                attr_type: Some(AttributeType::Number),
                multiple_of: Some(2.0),
                ..Default::default()
            },
        )]);
        assert!(validate(&payload(json!({ "memory_gb": 16 })), &schema).ok);
        assert!(!validate(&payload(json!({ "memory_gb": 15 })), &schema).ok);
    }

    #[test]
    fn test_date_canonicalized_to_utc() {
        let schema = schema_with(vec![(
            "commissioned_at",
            AttributeSchema {
                attr_type: Some(AttributeType::Date),
                ..Default::default()
            },
        )]);
        let result = validate(
            &payload(json!({ "commissioned_at": "2024-03-01T12:00:00+02:00" })),
            &schema,
        );
        assert!(result.ok);
        assert_eq!(
            result.normalized["commissioned_at"],
            "2024-03-01T10:00:00.000Z"
        );
    }

    #[test]
    fn test_naive_date_rejected() {
        let schema = schema_with(vec![(
            "commissioned_at",
            AttributeSchema {
                attr_type: Some(AttributeType::Date),
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({ "commissioned_at": "2024-03-01" })), &schema);
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "date");
    }

    #[test]
    fn test_pattern_is_anchored() {
        let schema = schema_with(vec![(
            "hostname",
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                pattern: Some("[a-z]+-[0-9]+".to_string()),
                ..Default::default()
            },
        )]);
        assert!(validate(&payload(json!({ "hostname": "web-01" })), &schema).ok);
        // A substring match is not enough.
        assert!(!validate(&payload(json!({ "hostname": "xx web-01 yy" })), &schema).ok);
    }

    #[test]
    fn test_formats() {
        let cases = [
            (StringFormat::Email, "ops@example.com", "not-an-email"),
            (StringFormat::Ipv4, "10.0.0.1", "10.0.0.300"),
            (StringFormat::Url, "https://example.com/x", "example.com"),
            (
                StringFormat::Uuid,
                "11111111-1111-1111-1111-111111111111",
                "1111",
            ),
        ];
        for (format, good, bad) in cases {
            let schema = schema_with(vec![(
                "value",
                AttributeSchema {
                    attr_type: Some(AttributeType::String),
                    format: Some(format),
                    ..Default::default()
                },
            )]);
            assert!(
                validate(&payload(json!({ "value": good })), &schema).ok,
                "{:?} should accept {}",
                format,
                good
            );
            assert!(
                !validate(&payload(json!({ "value": bad })), &schema).ok,
                "{:?} should reject {}",
                format,
                bad
            );
        }
    }

    #[test]
    fn test_enum_membership() {
        let schema = schema_with(vec![(
            "tier",
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                enum_values: Some(vec![json!("gold"), json!("silver")]),
                ..Default::default()
            },
        )]);
        assert!(validate(&payload(json!({ "tier": "gold" })), &schema).ok);
        let result = validate(&payload(json!({ "tier": "bronze" })), &schema);
        assert_eq!(result.errors[0].code, "enum");
    }

    #[test]
    fn test_array_items_and_bounds() {
        let schema = schema_with(vec![(
            "ports",
            AttributeSchema {
                attr_type: Some(AttributeType::Array),
                min_items: Some(1),
                max_items: Some(3),
                items: Some(Box::new(AttributeSchema {
                    attr_type: Some(AttributeType::Number),
                    min: Some(1.0),
                    max: Some(65535.0),
                    ..Default::default()
                })),
                ..Default::default()
            },
        )]);
        assert!(validate(&payload(json!({ "ports": [80, 443] })), &schema).ok);
        let empty = validate(&payload(json!({ "ports": [] })), &schema);
        assert_eq!(empty.errors[0].code, "min_items");
        let bad_item = validate(&payload(json!({ "ports": [80, 99999] })), &schema);
        assert_eq!(bad_item.errors[0].code, "max");
        assert_eq!(bad_item.errors[0].field, "ports[1]");
    }

    #[test]
    fn test_nested_object() {
        let mut properties = BTreeMap::new();
        properties.insert(
            "vendor".to_string(),
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                required: true,
                ..Default::default()
            },
        );
        let schema = schema_with(vec![(
            "hardware",
            AttributeSchema {
                attr_type: Some(AttributeType::Object),
                properties: Some(properties),
                ..Default::default()
            },
        )]);
        assert!(validate(
            &payload(json!({ "hardware": { "vendor": "dell" } })),
            &schema
        )
        .ok);
        let missing = validate(&payload(json!({ "hardware": {} })), &schema);
        assert_eq!(missing.errors[0].field, "hardware.vendor");
    }

    #[test]
    fn test_unknown_fields_pass_through_when_lenient() {
        let schema = schema_with(vec![]);
        let result = validate(&payload(json!({ "extra": 42 })), &schema);
        assert!(result.ok);
        assert_eq!(result.normalized["extra"], 42);
    }

    #[test]
    fn test_unknown_fields_rejected_when_strict() {
        let mut schema = schema_with(vec![]);
        schema.strict = true;
        let result = validate(&payload(json!({ "extra": 42 })), &schema);
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "unknown_field");
    }

    #[test]
    fn test_invalid_schema_pattern_reports_error_not_panic() {
        let schema = schema_with(vec![(
            "name",
            AttributeSchema {
                attr_type: Some(AttributeType::String),
                pattern: Some("(unclosed".to_string()),
                ..Default::default()
            },
        )]);
        let result = validate(&payload(json!({ "name": "x" })), &schema);
        assert!(!result.ok);
        assert_eq!(result.errors[0].code, "pattern");
    }
}
