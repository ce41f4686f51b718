//! Schema Normalizer (C1): transforms tool/output JSON schemas into the
//! "strict" dialect required by the model API (§4.1).

use serde_json::{Map, Value};

use crate::error::RaafError;

/// Normalize `schema` into strict form.
///
/// - Object types gain `additionalProperties: false`.
/// - Every declared property is marked required, unless the schema already
///   carries an explicit `required` list, which is preserved as-is.
/// - A missing `properties` on an object becomes `{}`.
/// - `allOf` of length 1 is flattened into its parent.
/// - `anyOf` variants and array `items` are processed recursively.
/// - `$defs` and `definitions` are walked.
/// - `default: null` is dropped.
///
/// # Errors
/// Returns [`RaafError::InvalidSchema`] if an explicit `additionalProperties: true`
/// is encountered anywhere in the schema.
pub fn normalize_strict(schema: &Value) -> Result<Value, RaafError> {
    normalize_value(schema)
}

fn normalize_value(value: &Value) -> Result<Value, RaafError> {
    match value {
        Value::Object(map) => normalize_object(map),
        Value::Array(items) => {
            let normalized = items
                .iter()
                .map(normalize_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(normalized))
        }
        other => Ok(other.clone()),
    }
}

fn normalize_object(map: &Map<String, Value>) -> Result<Value, RaafError> {
    if let Some(Value::Bool(true)) = map.get("additionalProperties") {
        return Err(RaafError::InvalidSchema(
            "additionalProperties: true is not permitted in strict schemas".into(),
        ));
    }

    let mut out = Map::new();
    for (key, val) in map {
        if key == "default" && val.is_null() {
            continue;
        }
        out.insert(key.clone(), val.clone());
    }

    // Flatten `allOf` of length 1 into the parent object.
    if let Some(Value::Array(all_of)) = out.get("allOf").cloned() {
        if all_of.len() == 1 {
            out.remove("allOf");
            if let Value::Object(inner) = normalize_value(&all_of[0])? {
                for (k, v) in inner {
                    out.entry(k).or_insert(v);
                }
            }
        } else {
            let normalized = all_of
                .iter()
                .map(normalize_value)
                .collect::<Result<Vec<_>, _>>()?;
            out.insert("allOf".into(), Value::Array(normalized));
        }
    }

    if let Some(Value::Array(any_of)) = out.get("anyOf").cloned() {
        let normalized = any_of
            .iter()
            .map(normalize_value)
            .collect::<Result<Vec<_>, _>>()?;
        out.insert("anyOf".into(), Value::Array(normalized));
    }

    if let Some(items) = out.get("items").cloned() {
        out.insert("items".into(), normalize_value(&items)?);
    }

    for defs_key in ["$defs", "definitions"] {
        if let Some(Value::Object(defs)) = out.get(defs_key).cloned() {
            let mut normalized_defs = Map::new();
            for (name, def) in defs {
                normalized_defs.insert(name, normalize_value(&def)?);
            }
            out.insert(defs_key.into(), Value::Object(normalized_defs));
        }
    }

    let is_object_type = matches!(out.get("type"), Some(Value::String(t)) if t == "object");
    if is_object_type {
        let properties = match out.get("properties").cloned() {
            Some(Value::Object(props)) => props,
            _ => Map::new(),
        };

        let mut normalized_props = Map::new();
        for (name, prop_schema) in &properties {
            normalized_props.insert(name.clone(), normalize_value(prop_schema)?);
        }

        let required = if out.contains_key("required") {
            out.get("required").cloned().unwrap_or(Value::Array(vec![]))
        } else {
            Value::Array(
                normalized_props
                    .keys()
                    .map(|k| Value::String(k.clone()))
                    .collect(),
            )
        };

        out.insert("properties".into(), Value::Object(normalized_props));
        out.insert("required".into(), required);
        out.insert("additionalProperties".into(), Value::Bool(false));
    }

    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn marks_all_properties_required_and_closes_object() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "number"}}
        });
        let normalized = normalize_strict(&schema).unwrap();
        assert_eq!(normalized["additionalProperties"], json!(false));
        let required = normalized["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")));
        assert!(required.contains(&json!("b")));
    }

    #[test]
    fn preserves_explicit_required_list() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "number"}},
            "required": ["a"]
        });
        let normalized = normalize_strict(&schema).unwrap();
        assert_eq!(normalized["required"], json!(["a"]));
    }

    #[test]
    fn missing_properties_becomes_empty_object() {
        let schema = json!({"type": "object"});
        let normalized = normalize_strict(&schema).unwrap();
        assert_eq!(normalized["properties"], json!({}));
    }

    #[test]
    fn rejects_explicit_additional_properties_true() {
        let schema = json!({"type": "object", "additionalProperties": true});
        assert!(matches!(
            normalize_strict(&schema),
            Err(RaafError::InvalidSchema(_))
        ));
    }

    #[test]
    fn drops_null_default() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string", "default": null}}
        });
        let normalized = normalize_strict(&schema).unwrap();
        assert!(!normalized["properties"]["a"]
            .as_object()
            .unwrap()
            .contains_key("default"));
    }

    #[test]
    fn flattens_single_all_of() {
        let schema = json!({
            "allOf": [{"type": "object", "properties": {"a": {"type": "string"}}}]
        });
        let normalized = normalize_strict(&schema).unwrap();
        assert_eq!(normalized["type"], json!("object"));
        assert!(normalized.get("allOf").is_none());
    }

    #[test]
    fn is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "string"},
                "nested": {"type": "object", "properties": {"x": {"type": "number"}}}
            }
        });
        let once = normalize_strict(&schema).unwrap();
        let twice = normalize_strict(&once).unwrap();
        assert_eq!(once, twice);
    }
}
