//! Avro schema engine.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::LazyLock;

use apache_avro::schema::RecordField;
use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use dashmap::DashMap;
use serde_json::Value;

use super::{wants_backward, wants_forward, CompatCheck};
use crate::error::{RegistryError, Result};
use crate::model::CompatibilityLevel;

static PARSED: LazyLock<DashMap<String, AvroSchema>> = LazyLock::new(DashMap::new);

fn parse(text: &str) -> Result<AvroSchema> {
    if let Some(schema) = PARSED.get(text) {
        return Ok(schema.clone());
    }
    let schema = AvroSchema::parse_str(text)
        .map_err(|e| RegistryError::InvalidSchema(format!("avro: {e}")))?;
    PARSED.insert(text.to_string(), schema.clone());
    Ok(schema)
}

pub fn validate(text: &str) -> Result<()> {
    parse(text).map(|_| ())
}

pub fn serialize(value: &Value, schema_text: &str) -> Result<Vec<u8>> {
    let schema = parse(schema_text)?;
    let mut names = HashMap::new();
    collect_named(&schema, &mut names);
    let datum = json_to_avro(value, &schema, &names)?;
    apache_avro::to_avro_datum(&schema, datum)
        .map_err(|e| RegistryError::BadRequest(format!("avro encode: {e}")))
}

pub fn deserialize(data: &[u8], schema_text: &str) -> Result<Value> {
    let schema = parse(schema_text)?;
    let datum = apache_avro::from_avro_datum(&schema, &mut Cursor::new(data), None)
        .map_err(|e| RegistryError::BadRequest(format!("avro decode: {e}")))?;
    Value::try_from(datum).map_err(|e| RegistryError::Internal(format!("avro to json: {e}")))
}

pub fn check_compatibility(
    old_text: &str,
    new_text: &str,
    level: CompatibilityLevel,
) -> Result<CompatCheck> {
    let old = parse(old_text)?;
    let new = parse(new_text)?;
    if wants_backward(level) {
        if let Some(reason) = backward_incompat(&old, &new) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    if wants_forward(level) {
        if let Some(reason) = forward_incompat(&old, &new) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    Ok(CompatCheck::ok())
}

/// A field is required unless its type is a union containing `"null"`.
fn field_required(field: &RecordField) -> bool {
    !matches!(
        &field.schema,
        AvroSchema::Union(u) if u.variants().iter().any(|v| matches!(v, AvroSchema::Null))
    )
}

fn fields_by_name(fields: &[RecordField]) -> HashMap<&str, &RecordField> {
    fields.iter().map(|f| (f.name.as_str(), f)).collect()
}

/// `None` when a reader using `new` can decode data written by `old`.
///
/// Every old field must survive with a promotable type or have been optional;
/// a field the new reader requires but the old writer never produced is
/// likewise undecodable.
fn backward_incompat(old: &AvroSchema, new: &AvroSchema) -> Option<String> {
    match (old, new) {
        (AvroSchema::Record(o), AvroSchema::Record(n)) => {
            let old_fields = fields_by_name(&o.fields);
            let new_fields = fields_by_name(&n.fields);
            for of in &o.fields {
                match new_fields.get(of.name.as_str()) {
                    None => {
                        if field_required(of) {
                            return Some(format!(
                                "required field {} removed in new schema",
                                of.name
                            ));
                        }
                    }
                    Some(nf) => {
                        if !promotable(&of.schema, &nf.schema) {
                            return Some(format!(
                                "incompatible type change for field {}",
                                of.name
                            ));
                        }
                    }
                }
            }
            for nf in &n.fields {
                if !old_fields.contains_key(nf.name.as_str()) && field_required(nf) {
                    return Some(format!("required field {} added in new schema", nf.name));
                }
            }
            None
        }
        _ => {
            if promotable(old, new) {
                None
            } else {
                Some("new schema cannot read data written with old schema".to_string())
            }
        }
    }
}

/// Mirror image of [`backward_incompat`]: a reader using `old` must decode
/// data written by `new`.
fn forward_incompat(old: &AvroSchema, new: &AvroSchema) -> Option<String> {
    match (old, new) {
        (AvroSchema::Record(o), AvroSchema::Record(n)) => {
            let old_fields = fields_by_name(&o.fields);
            let new_fields = fields_by_name(&n.fields);
            for nf in &n.fields {
                match old_fields.get(nf.name.as_str()) {
                    None => {
                        if field_required(nf) {
                            return Some(format!(
                                "required field {} added in new schema",
                                nf.name
                            ));
                        }
                    }
                    Some(of) => {
                        if !promotable(&nf.schema, &of.schema) {
                            return Some(format!(
                                "incompatible type change for field {}",
                                nf.name
                            ));
                        }
                    }
                }
            }
            for of in &o.fields {
                if !new_fields.contains_key(of.name.as_str()) && field_required(of) {
                    return Some(format!(
                        "required field {} removed in new schema",
                        of.name
                    ));
                }
            }
            None
        }
        _ => {
            if promotable(new, old) {
                None
            } else {
                Some("old schema cannot read data written with new schema".to_string())
            }
        }
    }
}

/// Whether a reader expecting `to` can decode a value written as `from`.
///
/// Nested records carry the full field contract: every writer field must
/// survive with a promotable type, and the reader must not require a field
/// the writer never produced.
fn promotable(from: &AvroSchema, to: &AvroSchema) -> bool {
    match (from, to) {
        (AvroSchema::Null, AvroSchema::Null) => true,
        (AvroSchema::Boolean, AvroSchema::Boolean) => true,
        (
            AvroSchema::Int,
            AvroSchema::Int | AvroSchema::Long | AvroSchema::Float | AvroSchema::Double,
        ) => true,
        (AvroSchema::Long, AvroSchema::Long | AvroSchema::Float | AvroSchema::Double) => true,
        (AvroSchema::Float, AvroSchema::Float | AvroSchema::Double) => true,
        (AvroSchema::Double, AvroSchema::Double) => true,
        (AvroSchema::Bytes, AvroSchema::Bytes | AvroSchema::String) => true,
        (AvroSchema::String, AvroSchema::String) => true,
        (AvroSchema::Array(f), AvroSchema::Array(t)) => promotable(&f.items, &t.items),
        (AvroSchema::Map(f), AvroSchema::Map(t)) => promotable(&f.types, &t.types),
        (AvroSchema::Record(f), AvroSchema::Record(t)) => {
            let from_fields = fields_by_name(&f.fields);
            let to_fields = fields_by_name(&t.fields);
            f.fields.iter().all(|ff| {
                to_fields
                    .get(ff.name.as_str())
                    .is_some_and(|tf| promotable(&ff.schema, &tf.schema))
            }) && t.fields.iter().all(|tf| {
                from_fields.contains_key(tf.name.as_str()) || !field_required(tf)
            })
        }
        (AvroSchema::Enum(f), AvroSchema::Enum(t)) => f
            .symbols
            .iter()
            .all(|symbol| t.symbols.contains(symbol)),
        (AvroSchema::Union(f), AvroSchema::Union(t)) => f
            .variants()
            .iter()
            .all(|fv| t.variants().iter().any(|tv| tv == fv)),
        (AvroSchema::Fixed(f), AvroSchema::Fixed(t)) => f.name == t.name && f.size == t.size,
        // Logical types and named references promote only to themselves.
        (a, b) => a == b,
    }
}

/// Named types (records, enums, fixeds) by fullname, for resolving refs.
fn collect_named<'s>(schema: &'s AvroSchema, names: &mut HashMap<String, &'s AvroSchema>) {
    match schema {
        AvroSchema::Record(r) => {
            names.insert(r.name.fullname(None), schema);
            for field in &r.fields {
                collect_named(&field.schema, names);
            }
        }
        AvroSchema::Enum(e) => {
            names.insert(e.name.fullname(None), schema);
        }
        AvroSchema::Fixed(f) => {
            names.insert(f.name.fullname(None), schema);
        }
        AvroSchema::Array(a) => collect_named(&a.items, names),
        AvroSchema::Map(m) => collect_named(&m.types, names),
        AvroSchema::Union(u) => {
            for variant in u.variants() {
                collect_named(variant, names);
            }
        }
        _ => {}
    }
}

/// Builds an Avro value from the canonical JSON tree, guided by the schema.
fn json_to_avro(
    value: &Value,
    schema: &AvroSchema,
    names: &HashMap<String, &AvroSchema>,
) -> Result<AvroValue> {
    let mismatch = |expected: &str| {
        RegistryError::BadRequest(format!("expected {expected}, got {value}"))
    };
    match schema {
        AvroSchema::Null => match value {
            Value::Null => Ok(AvroValue::Null),
            _ => Err(mismatch("null")),
        },
        AvroSchema::Boolean => value
            .as_bool()
            .map(AvroValue::Boolean)
            .ok_or_else(|| mismatch("boolean")),
        AvroSchema::Int => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(AvroValue::Int)
            .ok_or_else(|| mismatch("int")),
        AvroSchema::Long => value
            .as_i64()
            .map(AvroValue::Long)
            .ok_or_else(|| mismatch("long")),
        AvroSchema::Float => value
            .as_f64()
            .map(|n| AvroValue::Float(n as f32))
            .ok_or_else(|| mismatch("float")),
        AvroSchema::Double => value
            .as_f64()
            .map(AvroValue::Double)
            .ok_or_else(|| mismatch("double")),
        AvroSchema::Bytes => json_bytes(value)
            .map(AvroValue::Bytes)
            .ok_or_else(|| mismatch("bytes")),
        AvroSchema::String => value
            .as_str()
            .map(|s| AvroValue::String(s.to_string()))
            .ok_or_else(|| mismatch("string")),
        AvroSchema::Fixed(f) => {
            let bytes = json_bytes(value).ok_or_else(|| mismatch("fixed"))?;
            if bytes.len() != f.size {
                return Err(RegistryError::BadRequest(format!(
                    "fixed {} expects {} bytes, got {}",
                    f.name.fullname(None),
                    f.size,
                    bytes.len()
                )));
            }
            Ok(AvroValue::Fixed(f.size, bytes))
        }
        AvroSchema::Enum(e) => {
            let symbol = value.as_str().ok_or_else(|| mismatch("enum symbol"))?;
            let position = e
                .symbols
                .iter()
                .position(|s| s == symbol)
                .ok_or_else(|| {
                    RegistryError::BadRequest(format!(
                        "unknown symbol {symbol} for enum {}",
                        e.name.fullname(None)
                    ))
                })?;
            Ok(AvroValue::Enum(position as u32, symbol.to_string()))
        }
        AvroSchema::Array(a) => {
            let items = value.as_array().ok_or_else(|| mismatch("array"))?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_to_avro(item, &a.items, names)?);
            }
            Ok(AvroValue::Array(out))
        }
        AvroSchema::Map(m) => {
            let entries = value.as_object().ok_or_else(|| mismatch("map"))?;
            let mut out = HashMap::with_capacity(entries.len());
            for (key, item) in entries {
                out.insert(key.clone(), json_to_avro(item, &m.types, names)?);
            }
            Ok(AvroValue::Map(out))
        }
        AvroSchema::Union(u) => {
            for (position, variant) in u.variants().iter().enumerate() {
                if let Ok(inner) = json_to_avro(value, variant, names) {
                    return Ok(AvroValue::Union(position as u32, Box::new(inner)));
                }
            }
            Err(RegistryError::BadRequest(format!(
                "{value} matches no branch of the union"
            )))
        }
        AvroSchema::Record(r) => {
            let object = value.as_object().ok_or_else(|| mismatch("record"))?;
            let mut fields = Vec::with_capacity(r.fields.len());
            for field in &r.fields {
                let item = match object.get(&field.name) {
                    Some(item) => json_to_avro(item, &field.schema, names)?,
                    None => match &field.default {
                        Some(default) => json_to_avro(default, &field.schema, names)?,
                        None => {
                            return Err(RegistryError::BadRequest(format!(
                                "missing field {} for record {}",
                                field.name,
                                r.name.fullname(None)
                            )))
                        }
                    },
                };
                fields.push((field.name.clone(), item));
            }
            Ok(AvroValue::Record(fields))
        }
        AvroSchema::Ref { name } => {
            let target = names.get(&name.fullname(None)).ok_or_else(|| {
                RegistryError::InvalidSchema(format!(
                    "unresolved schema reference {}",
                    name.fullname(None)
                ))
            })?;
            json_to_avro(value, target, names)
        }
        AvroSchema::Date | AvroSchema::TimeMillis => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(AvroValue::Int)
            .ok_or_else(|| mismatch("int")),
        AvroSchema::TimeMicros
        | AvroSchema::TimestampMillis
        | AvroSchema::TimestampMicros
        | AvroSchema::LocalTimestampMillis
        | AvroSchema::LocalTimestampMicros => value
            .as_i64()
            .map(AvroValue::Long)
            .ok_or_else(|| mismatch("long")),
        other => Err(RegistryError::BadRequest(format!(
            "unsupported avro type for data conversion: {other:?}"
        ))),
    }
}

/// Bytes from either a JSON string (UTF-8) or an array of byte numbers.
fn json_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        _ => None,
    }
}
