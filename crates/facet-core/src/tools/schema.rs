//! JSON Schema validation (subset).
//!
//! Supported keywords: `type`, `enum`, `const`, `properties`, `required`,
//! `additionalProperties`, `items`, `minItems`, `maxItems`, `minLength`,
//! `maxLength`, `minimum`, `maximum`. Other keywords are ignored.
//! Boolean schemas (`true` / `false`) are accepted.

use crate::registry::ToolError;
use serde_json::{Map, Value};

/// Validate `instance` against `schema`.
///
/// Returns the list of violations (empty when valid). Each violation is
/// prefixed with the JSON path of the offending value. A malformed schema is
/// an `InvalidArguments` error rather than a violation.
pub fn validate(instance: &Value, schema: &Value) -> Result<Vec<String>, ToolError> {
    let mut errors = Vec::new();
    check(instance, schema, "$", &mut errors)?;
    Ok(errors)
}

fn check(
    instance: &Value,
    schema: &Value,
    path: &str,
    errors: &mut Vec<String>,
) -> Result<(), ToolError> {
    let schema = match schema {
        Value::Bool(true) => return Ok(()),
        Value::Bool(false) => {
            errors.push(format!("{}: no value is allowed here", path));
            return Ok(());
        }
        Value::Object(map) => map,
        other => {
            return Err(ToolError::invalid(format!(
                "Invalid schema at {}: expected object or boolean, got {}",
                path,
                type_name(other)
            )))
        }
    };

    if let Some(expected) = schema.get("type") {
        let allowed = type_list(expected, path)?;
        if !allowed.iter().any(|t| matches_type(instance, t)) {
            errors.push(format!(
                "{}: expected {}, got {}",
                path,
                allowed.join(" or "),
                type_name(instance)
            ));
            // Further keywords assume the type matched.
            return Ok(());
        }
    }

    if let Some(options) = schema.get("enum") {
        let options = options
            .as_array()
            .ok_or_else(|| {
                ToolError::invalid(format!("Invalid schema at {}: enum must be an array", path))
            })?;
        if !options.contains(instance) {
            let allowed = Value::Array(options.clone());
            errors.push(format!("{}: {} is not one of {}", path, instance, allowed));
        }
    }

    if let Some(constant) = schema.get("const") {
        if constant != instance {
            errors.push(format!("{}: expected constant {}", path, constant));
        }
    }

    match instance {
        Value::Object(object) => check_object(object, schema, path, errors)?,
        Value::Array(items) => check_array(items, schema, path, errors)?,
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = bound(schema, "minLength", path)? {
                if len < min {
                    errors.push(format!("{}: string shorter than {} characters", path, min));
                }
            }
            if let Some(max) = bound(schema, "maxLength", path)? {
                if len > max {
                    errors.push(format!("{}: string longer than {} characters", path, max));
                }
            }
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    errors.push(format!("{}: {} is less than minimum {}", path, n, min));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    errors.push(format!("{}: {} is greater than maximum {}", path, n, max));
                }
            }
        }
        Value::Bool(_) | Value::Null => {}
    }

    Ok(())
}

fn check_object(
    object: &Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) -> Result<(), ToolError> {
    if let Some(required) = schema.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| {
                ToolError::invalid(format!(
                    "Invalid schema at {}: required must be an array",
                    path
                ))
            })?;
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                errors.push(format!("{}: missing required property '{}'", path, name));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (name, sub_schema) in properties {
            if let Some(value) = object.get(name) {
                check(value, sub_schema, &format!("{}.{}", path, name), errors)?;
            }
        }
    }

    if let Some(additional) = schema.get("additionalProperties") {
        for (name, value) in object {
            if properties.is_some_and(|p| p.contains_key(name)) {
                continue;
            }
            match additional {
                Value::Bool(false) => {
                    errors.push(format!("{}: additional property '{}' is not allowed", path, name))
                }
                Value::Bool(true) => {}
                sub_schema => check(value, sub_schema, &format!("{}.{}", path, name), errors)?,
            }
        }
    }

    Ok(())
}

fn check_array(
    items: &[Value],
    schema: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) -> Result<(), ToolError> {
    let len = items.len() as u64;
    if let Some(min) = bound(schema, "minItems", path)? {
        if len < min {
            errors.push(format!("{}: expected at least {} items, got {}", path, min, len));
        }
    }
    if let Some(max) = bound(schema, "maxItems", path)? {
        if len > max {
            errors.push(format!("{}: expected at most {} items, got {}", path, max, len));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{}[{}]", path, i), errors)?;
        }
    }
    Ok(())
}

fn type_list(expected: &Value, path: &str) -> Result<Vec<String>, ToolError> {
    let names: Vec<String> = match expected {
        Value::String(s) => vec![s.clone()],
        Value::Array(list) => list.iter().filter_map(Value::as_str).map(String::from).collect(),
        _ => Vec::new(),
    };
    let known = ["object", "array", "string", "number", "integer", "boolean", "null"];
    if names.is_empty() || names.iter().any(|n| !known.contains(&n.as_str())) {
        return Err(ToolError::invalid(format!(
            "Invalid schema at {}: unsupported type {}",
            path, expected
        )));
    }
    Ok(names)
}

fn matches_type(instance: &Value, name: &str) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => false,
    }
}

fn bound(schema: &Map<String, Value>, keyword: &str, path: &str) -> Result<Option<u64>, ToolError> {
    match schema.get(keyword) {
        None => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ToolError::invalid(format!(
                "Invalid schema at {}: {} must be a non-negative integer",
                path, keyword
            ))
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
