//! Minimal JSON schema validation for tool inputs and agent outputs.
//!
//! Supports the subset tool schemas actually use: `type` (single or list),
//! `required`, `properties`, `additionalProperties: false`, `items` and `enum`.
//! Unknown keywords are ignored.

use serde_json::{Map, Value};

/// A single validation failure with a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validates `value` against `schema`, collecting every failure.
///
/// # Errors
/// Returns all failures found, in document order.
pub fn validate(schema: &Value, value: &Value) -> Result<(), Vec<SchemaError>> {
    let mut errors = Vec::new();
    check(schema, value, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Joins errors into one line for tool failure details.
pub fn describe(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<SchemaError>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type")
        && !type_matches(expected, value)
    {
        errors.push(SchemaError {
            path: path.to_string(),
            message: format!("expected {}, got {}", type_label(expected), json_type(value)),
        });
        return;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum")
        && !allowed.contains(value)
    {
        let options = allowed
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        errors.push(SchemaError {
            path: path.to_string(),
            message: format!("must be one of {options}"),
        });
    }

    match value {
        Value::Object(map) => check_object(schema, map, path, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}/{i}"), errors);
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<SchemaError>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                errors.push(SchemaError {
                    path: path.to_string(),
                    message: format!("missing required property '{key}'"),
                });
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, prop_schema) in properties {
            if let Some(prop) = map.get(key) {
                check(prop_schema, prop, &format!("{path}/{key}"), errors);
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in map.keys() {
            if !properties.is_some_and(|p| p.contains_key(key)) {
                errors.push(SchemaError {
                    path: path.to_string(),
                    message: format!("unexpected property '{key}'"),
                });
            }
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_label(expected: &Value) -> String {
    match expected {
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.as_str().unwrap_or("value").to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn add_numbers_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        })
    }

    #[test]
    fn accepts_valid_object() {
        assert!(validate(&add_numbers_schema(), &json!({"a": 2, "b": 3.5})).is_ok());
    }

    #[test]
    fn reports_missing_and_mistyped_properties() {
        let errors = validate(&add_numbers_schema(), &json!({"a": "two"})).unwrap_err();
        assert_eq!(
            describe(&errors),
            "missing required property 'b'; /a: expected number, got string"
        );
    }

    #[test]
    fn rejects_unexpected_properties_when_closed() {
        let errors =
            validate(&add_numbers_schema(), &json!({"a": 1, "b": 2, "c": 3})).unwrap_err();
        assert_eq!(errors[0].message, "unexpected property 'c'");
    }

    #[test]
    fn checks_items_and_enums() {
        let schema = json!({
            "type": "array",
            "items": {"type": "string", "enum": ["low", "high"]}
        });
        assert!(validate(&schema, &json!(["low", "high"])).is_ok());
        let errors = validate(&schema, &json!(["low", "mid", 3])).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].path, "/1");
        assert_eq!(errors[1].message, "expected string, got integer");
    }

    #[test]
    fn integer_rejects_fractions_and_type_lists_accept_any() {
        assert!(validate(&json!({"type": "integer"}), &json!(1.5)).is_err());
        assert!(validate(&json!({"type": ["string", "null"]}), &Value::Null).is_ok());
    }
}
