//! Per-format schema engines.
//!
//! Each format implements the same capability set (validate, serialize,
//! deserialize, and pairwise compatibility checking) dispatched on
//! [`SchemaType`] as a closed set of variants. The transitive iteration over
//! prior versions is owned by the registry; engines only ever compare two
//! schemas.
//!
//! The canonical generic value representation on either side of a payload is
//! [`serde_json::Value`]: serializers accept a JSON value tree and emit
//! format-encoded bytes, deserializers reverse that.

use serde_json::Value;

use crate::error::Result;
use crate::model::{CompatibilityLevel, SchemaType};

pub mod avro;
pub mod json;
pub mod protobuf;

/// Outcome of a pairwise compatibility check.
///
/// A definite incompatibility carries the reason; engines fail closed, so an
/// unparseable schema surfaces as `InvalidSchema` rather than a silent pass.
#[derive(Clone, Debug)]
pub struct CompatCheck {
    pub is_compatible: bool,
    pub reason: Option<String>,
}

impl CompatCheck {
    pub(crate) fn ok() -> Self {
        CompatCheck {
            is_compatible: true,
            reason: None,
        }
    }

    pub(crate) fn broken(reason: impl Into<String>) -> Self {
        CompatCheck {
            is_compatible: false,
            reason: Some(reason.into()),
        }
    }
}

/// Checks that `text` parses under `schema_type`.
pub fn validate(schema_type: SchemaType, text: &str) -> Result<()> {
    match schema_type {
        SchemaType::Avro => avro::validate(text),
        SchemaType::Json => json::validate(text),
        SchemaType::Protobuf => protobuf::validate(text),
    }
}

/// Pairwise compatibility of `new_text` against `old_text` at `level`.
///
/// Transitive levels apply their base rule here; iterating prior versions is
/// the caller's job.
pub fn check_compatibility(
    schema_type: SchemaType,
    old_text: &str,
    new_text: &str,
    level: CompatibilityLevel,
) -> Result<CompatCheck> {
    if level == CompatibilityLevel::None {
        return Ok(CompatCheck::ok());
    }
    match schema_type {
        SchemaType::Avro => avro::check_compatibility(old_text, new_text, level),
        SchemaType::Json => json::check_compatibility(old_text, new_text, level),
        SchemaType::Protobuf => protobuf::check_compatibility(old_text, new_text, level),
    }
}

/// Encodes `value` according to `schema_text`.
pub fn serialize(schema_type: SchemaType, value: &Value, schema_text: &str) -> Result<Vec<u8>> {
    match schema_type {
        SchemaType::Avro => avro::serialize(value, schema_text),
        SchemaType::Json => json::serialize(value, schema_text),
        SchemaType::Protobuf => protobuf::serialize(value, schema_text),
    }
}

/// Decodes `data` according to `schema_text`.
pub fn deserialize(schema_type: SchemaType, data: &[u8], schema_text: &str) -> Result<Value> {
    match schema_type {
        SchemaType::Avro => avro::deserialize(data, schema_text),
        SchemaType::Json => json::deserialize(data, schema_text),
        SchemaType::Protobuf => protobuf::deserialize(data, schema_text),
    }
}

/// Whether `level` requires the backward direction (new reads old).
pub(crate) fn wants_backward(level: CompatibilityLevel) -> bool {
    matches!(
        level,
        CompatibilityLevel::Backward
            | CompatibilityLevel::BackwardTransitive
            | CompatibilityLevel::Full
            | CompatibilityLevel::FullTransitive
    )
}

/// Whether `level` requires the forward direction (old reads new).
pub(crate) fn wants_forward(level: CompatibilityLevel) -> bool {
    matches!(
        level,
        CompatibilityLevel::Forward
            | CompatibilityLevel::ForwardTransitive
            | CompatibilityLevel::Full
            | CompatibilityLevel::FullTransitive
    )
}
