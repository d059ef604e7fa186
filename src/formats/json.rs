//! JSON Schema engine.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use jsonschema::Validator;
use serde_json::Value;

use super::{wants_backward, wants_forward, CompatCheck};
use crate::error::{RegistryError, Result};
use crate::model::CompatibilityLevel;

static VALIDATORS: LazyLock<DashMap<String, Arc<Validator>>> = LazyLock::new(DashMap::new);

fn compile(text: &str) -> Result<Arc<Validator>> {
    if let Some(validator) = VALIDATORS.get(text) {
        return Ok(validator.clone());
    }
    let parsed: Value = serde_json::from_str(text)
        .map_err(|e| RegistryError::InvalidSchema(format!("json schema: {e}")))?;
    let validator = Arc::new(
        jsonschema::validator_for(&parsed)
            .map_err(|e| RegistryError::InvalidSchema(format!("json schema: {e}")))?,
    );
    VALIDATORS.insert(text.to_string(), validator.clone());
    Ok(validator)
}

pub fn validate(text: &str) -> Result<()> {
    compile(text).map(|_| ())
}

pub fn serialize(value: &Value, schema_text: &str) -> Result<Vec<u8>> {
    let validator = compile(schema_text)?;
    validator
        .validate(value)
        .map_err(|e| RegistryError::BadRequest(format!("json validate: {e}")))?;
    serde_json::to_vec(value).map_err(|e| RegistryError::Internal(format!("json encode: {e}")))
}

pub fn deserialize(data: &[u8], schema_text: &str) -> Result<Value> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| RegistryError::BadRequest(format!("json decode: {e}")))?;
    let validator = compile(schema_text)?;
    validator
        .validate(&value)
        .map_err(|e| RegistryError::BadRequest(format!("json validate: {e}")))?;
    Ok(value)
}

pub fn check_compatibility(
    old_text: &str,
    new_text: &str,
    level: CompatibilityLevel,
) -> Result<CompatCheck> {
    let old_props = properties(old_text)?;
    let new_props = properties(new_text)?;
    if wants_backward(level) {
        if let Some(reason) = backward_incompat(&old_props, &new_props) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    if wants_forward(level) {
        if let Some(reason) = forward_incompat(&old_props, &new_props) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    Ok(CompatCheck::ok())
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct PropertyInfo {
    required: bool,
    type_name: String,
}

/// Top-level `properties`, with requiredness taken from the top-level
/// `required` array and a default type of `object`.
fn properties(text: &str) -> Result<HashMap<String, PropertyInfo>> {
    let schema: Value = serde_json::from_str(text)
        .map_err(|e| RegistryError::InvalidSchema(format!("json schema: {e}")))?;

    let mut props = HashMap::new();
    let Some(prop_map) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(props);
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    for (name, prop) in prop_map {
        let type_name = prop
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("object")
            .to_string();
        props.insert(
            name.clone(),
            PropertyInfo {
                required: required.contains(&name.as_str()),
                type_name,
            },
        );
    }
    Ok(props)
}

fn backward_incompat(
    old_props: &HashMap<String, PropertyInfo>,
    new_props: &HashMap<String, PropertyInfo>,
) -> Option<String> {
    for (name, old_prop) in old_props {
        let Some(new_prop) = new_props.get(name) else {
            if old_prop.required {
                return Some(format!("required property {name} was removed"));
            }
            continue;
        };
        if !type_compatible(&old_prop.type_name, &new_prop.type_name) {
            return Some(format!(
                "incompatible types for property {name}: {} -> {}",
                old_prop.type_name, new_prop.type_name
            ));
        }
        if !old_prop.required && new_prop.required {
            return Some(format!("property {name} became required"));
        }
    }
    None
}

fn forward_incompat(
    old_props: &HashMap<String, PropertyInfo>,
    new_props: &HashMap<String, PropertyInfo>,
) -> Option<String> {
    for (name, new_prop) in new_props {
        let Some(old_prop) = old_props.get(name) else {
            if new_prop.required {
                return Some(format!("new required property {name} was added"));
            }
            continue;
        };
        if !type_compatible(&new_prop.type_name, &old_prop.type_name) {
            return Some(format!(
                "incompatible types for property {name}: {} -> {}",
                new_prop.type_name, old_prop.type_name
            ));
        }
        if old_prop.required && !new_prop.required {
            return Some(format!("property {name} became optional"));
        }
    }
    None
}

/// Type matching is identity. `integer` deliberately does not unify with
/// `number`: a reader validating `integer` rejects fractional writer data.
fn type_compatible(old_type: &str, new_type: &str) -> bool {
    matches!(
        old_type,
        "null" | "boolean" | "integer" | "number" | "string" | "array" | "object"
    ) && old_type == new_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POINT_V1: &str = r#"{
        "type": "object",
        "properties": {"x": {"type": "integer"}},
        "required": ["x"]
    }"#;

    #[test]
    fn validate_accepts_object_schema() {
        assert!(validate(POINT_V1).is_ok());
    }

    #[test]
    fn validate_rejects_malformed_json() {
        assert!(matches!(
            validate(r#"{"type": "object""#),
            Err(RegistryError::InvalidSchema(_))
        ));
    }

    #[test]
    fn integer_does_not_unify_with_number() {
        let number = r#"{
            "type": "object",
            "properties": {"x": {"type": "number"}},
            "required": ["x"]
        }"#;
        let check = check_compatibility(POINT_V1, number, CompatibilityLevel::Backward).unwrap();
        assert!(!check.is_compatible);
        assert!(check.reason.unwrap().contains("x"));
    }

    #[test]
    fn adding_optional_property_is_backward_compatible() {
        let new = r#"{
            "type": "object",
            "properties": {"x": {"type": "integer"}, "label": {"type": "string"}},
            "required": ["x"]
        }"#;
        assert!(
            check_compatibility(POINT_V1, new, CompatibilityLevel::Backward)
                .unwrap()
                .is_compatible
        );
    }

    #[test]
    fn adding_required_property_breaks_forward() {
        let new = r#"{
            "type": "object",
            "properties": {"x": {"type": "integer"}, "y": {"type": "integer"}},
            "required": ["x", "y"]
        }"#;
        let check = check_compatibility(POINT_V1, new, CompatibilityLevel::Forward).unwrap();
        assert!(!check.is_compatible);
    }

    #[test]
    fn removing_required_property_breaks_backward() {
        let empty = r#"{"type": "object", "properties": {}}"#;
        let check = check_compatibility(POINT_V1, empty, CompatibilityLevel::Backward).unwrap();
        assert!(!check.is_compatible);
        assert!(check.reason.unwrap().contains("required property x"));
    }

    #[test]
    fn property_becoming_required_breaks_backward() {
        let optional = r#"{"type": "object", "properties": {"x": {"type": "integer"}}}"#;
        let check = check_compatibility(optional, POINT_V1, CompatibilityLevel::Backward).unwrap();
        assert!(!check.is_compatible);
        assert!(check.reason.unwrap().contains("became required"));
    }

    #[test]
    fn property_type_defaults_to_object() {
        let untyped = r#"{"type": "object", "properties": {"x": {}}}"#;
        let object = r#"{"type": "object", "properties": {"x": {"type": "object"}}}"#;
        assert!(
            check_compatibility(untyped, object, CompatibilityLevel::Full)
                .unwrap()
                .is_compatible
        );
    }

    #[test]
    fn full_requires_both_directions() {
        let optional_y = r#"{
            "type": "object",
            "properties": {"x": {"type": "integer"}, "y": {"type": "string"}},
            "required": ["x"]
        }"#;
        assert!(
            check_compatibility(POINT_V1, optional_y, CompatibilityLevel::Full)
                .unwrap()
                .is_compatible
        );
    }

    #[test]
    fn serialize_validates_payload() {
        let good = json!({"x": 3});
        let bad = json!({"x": "three"});
        assert!(serialize(&good, POINT_V1).is_ok());
        assert!(matches!(
            serialize(&bad, POINT_V1),
            Err(RegistryError::BadRequest(_))
        ));
    }

    #[test]
    fn round_trip() {
        let data = json!({"x": 9});
        let bytes = serialize(&data, POINT_V1).unwrap();
        assert_eq!(deserialize(&bytes, POINT_V1).unwrap(), data);
    }
}
