//! Row validation against a JSON-schema subset.
//!
//! Tables declare their schema as a raw JSON value using a small subset of
//! JSON Schema: `type`, `properties`, `required`, `pattern`, `enum`,
//! `format` (only `date-time` is checked) and `items`. Unknown keywords are
//! ignored so that schemas written for a richer validator still load.

use crate::error::{Error, Result};
use regex::Regex;
use serde_json::Value;

/// Validate `row` against `schema`, reporting failures under `title`.
///
/// `title` gives the error message its context, typically
/// `"Adding row to Table('xyz')"`.
pub fn check_schema(row: &Value, schema: &Value, title: &str) -> Result<()> {
    let mut path = String::from("$");
    validate(row, schema, &mut path).map_err(|detail| {
        Error::Schema(format!("{}: {}", title, detail))
    })
}

fn validate(value: &Value, schema: &Value, path: &mut String) -> std::result::Result<(), String> {
    let schema = match schema.as_object() {
        Some(obj) => obj,
        None => return Ok(()), // Only object schemas carry rules.
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            return Err(format!(
                "{}: expected type '{}', got {} ({})",
                path,
                expected,
                type_name(value),
                short_repr(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!(
                "{}: {} is not one of {}",
                path,
                short_repr(value),
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        if let Some(text) = value.as_str() {
            let re = Regex::new(pattern)
                .map_err(|e| format!("{}: invalid pattern '{}': {}", path, pattern, e))?;
            if !re.is_match(text) {
                return Err(format!("{}: '{}' does not match '{}'", path, text, pattern));
            }
        }
    }

    if let Some(format) = schema.get("format").and_then(Value::as_str) {
        check_format(value, format, path)?;
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!("{}: '{}' is a required property", path, name));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in properties {
                if let Some(prop_value) = obj.get(name) {
                    let len = path.len();
                    path.push('.');
                    path.push_str(name);
                    let result = validate(prop_value, prop_schema, path);
                    path.truncate(len);
                    result?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema.get("items") {
            for (index, item) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{}]", index));
                let result = validate(item, item_schema, path);
                path.truncate(len);
                result?;
            }
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type names never reject; they are treated as annotations.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_format(value: &Value, format: &str, path: &str) -> std::result::Result<(), String> {
    if format != "date-time" {
        return Ok(()); // Other formats are annotations only.
    }
    let Some(text) = value.as_str() else {
        return Ok(());
    };
    if text.is_empty() {
        // Meta rows are created with empty timestamps before first save.
        return Ok(());
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|_| ())
        .map_err(|_| format!("{}: '{}' is not a date-time", path, text))
}

fn short_repr(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 60 {
        let head: String = text.chars().take(57).collect();
        format!("{}...", head)
    } else {
        text
    }
}
