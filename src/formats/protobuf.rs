//! Protobuf schema engine.
//!
//! A schema's text is a protojson-encoded `FileDescriptorProto`, the form the
//! registry's producers publish. The JSON is mirrored into
//! [`prost_types::FileDescriptorProto`] and linked into a
//! [`DescriptorPool`], which performs full descriptor validation; payloads
//! are transcoded through [`DynamicMessage`].

use std::sync::LazyLock;

use dashmap::DashMap;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, Kind, MessageDescriptor};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet,
};
use serde::Deserialize;
use serde_json::Value;

use super::{wants_backward, wants_forward, CompatCheck};
use crate::error::{RegistryError, Result};
use crate::model::CompatibilityLevel;

static POOLS: LazyLock<DashMap<String, DescriptorPool>> = LazyLock::new(DashMap::new);

// Serde mirror of the protojson FileDescriptorProto encoding. Only the
// descriptor surface the registry stores is mirrored; exotic options fail
// closed through the pool linker.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDescriptorJson {
    name: Option<String>,
    package: Option<String>,
    syntax: Option<String>,
    #[serde(default)]
    dependency: Vec<String>,
    #[serde(default)]
    message_type: Vec<MessageJson>,
    #[serde(default)]
    enum_type: Vec<EnumJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageJson {
    name: String,
    #[serde(default)]
    field: Vec<FieldJson>,
    #[serde(default)]
    nested_type: Vec<MessageJson>,
    #[serde(default)]
    enum_type: Vec<EnumJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldJson {
    name: String,
    number: i32,
    #[serde(rename = "type")]
    type_name: Option<String>,
    #[serde(rename = "typeName")]
    message_or_enum: Option<String>,
    label: Option<String>,
    json_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnumJson {
    name: String,
    #[serde(default)]
    value: Vec<EnumValueJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnumValueJson {
    name: String,
    number: i32,
}

fn field_type(name: &str) -> Result<Type> {
    let t = match name {
        "TYPE_DOUBLE" => Type::Double,
        "TYPE_FLOAT" => Type::Float,
        "TYPE_INT64" => Type::Int64,
        "TYPE_UINT64" => Type::Uint64,
        "TYPE_INT32" => Type::Int32,
        "TYPE_FIXED64" => Type::Fixed64,
        "TYPE_FIXED32" => Type::Fixed32,
        "TYPE_BOOL" => Type::Bool,
        "TYPE_STRING" => Type::String,
        "TYPE_GROUP" => Type::Group,
        "TYPE_MESSAGE" => Type::Message,
        "TYPE_BYTES" => Type::Bytes,
        "TYPE_UINT32" => Type::Uint32,
        "TYPE_ENUM" => Type::Enum,
        "TYPE_SFIXED32" => Type::Sfixed32,
        "TYPE_SFIXED64" => Type::Sfixed64,
        "TYPE_SINT32" => Type::Sint32,
        "TYPE_SINT64" => Type::Sint64,
        other => {
            return Err(RegistryError::InvalidSchema(format!(
                "protobuf: unknown field type {other}"
            )))
        }
    };
    Ok(t)
}

fn field_label(name: &str) -> Result<Label> {
    match name {
        "LABEL_OPTIONAL" => Ok(Label::Optional),
        "LABEL_REQUIRED" => Ok(Label::Required),
        "LABEL_REPEATED" => Ok(Label::Repeated),
        other => Err(RegistryError::InvalidSchema(format!(
            "protobuf: unknown field label {other}"
        ))),
    }
}

fn to_field_proto(field: FieldJson) -> Result<FieldDescriptorProto> {
    let label = match field.label.as_deref() {
        Some(label) => field_label(label)?,
        None => Label::Optional,
    };
    Ok(FieldDescriptorProto {
        name: Some(field.name),
        number: Some(field.number),
        label: Some(label as i32),
        r#type: field.type_name.as_deref().map(field_type).transpose()?.map(|t| t as i32),
        type_name: field.message_or_enum,
        json_name: field.json_name,
        ..Default::default()
    })
}

fn to_enum_proto(e: EnumJson) -> EnumDescriptorProto {
    EnumDescriptorProto {
        name: Some(e.name),
        value: e
            .value
            .into_iter()
            .map(|v| EnumValueDescriptorProto {
                name: Some(v.name),
                number: Some(v.number),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn to_message_proto(message: MessageJson) -> Result<DescriptorProto> {
    Ok(DescriptorProto {
        name: Some(message.name),
        field: message
            .field
            .into_iter()
            .map(to_field_proto)
            .collect::<Result<_>>()?,
        nested_type: message
            .nested_type
            .into_iter()
            .map(to_message_proto)
            .collect::<Result<_>>()?,
        enum_type: message.enum_type.into_iter().map(to_enum_proto).collect(),
        ..Default::default()
    })
}

fn to_file_proto(text: &str) -> Result<FileDescriptorProto> {
    let file: FileDescriptorJson = serde_json::from_str(text)
        .map_err(|e| RegistryError::InvalidSchema(format!("protobuf descriptor: {e}")))?;
    Ok(FileDescriptorProto {
        name: Some(file.name.unwrap_or_else(|| "schema.proto".to_string())),
        package: file.package,
        syntax: file.syntax,
        dependency: file.dependency,
        message_type: file
            .message_type
            .into_iter()
            .map(to_message_proto)
            .collect::<Result<_>>()?,
        enum_type: file.enum_type.into_iter().map(to_enum_proto).collect(),
        ..Default::default()
    })
}

/// Parses and links the descriptor, validating type references.
fn pool(text: &str) -> Result<DescriptorPool> {
    if let Some(pool) = POOLS.get(text) {
        return Ok(pool.clone());
    }
    let file = to_file_proto(text)?;
    let set = FileDescriptorSet { file: vec![file] };
    let pool = DescriptorPool::from_file_descriptor_set(set)
        .map_err(|e| RegistryError::InvalidSchema(format!("protobuf descriptor: {e}")))?;
    POOLS.insert(text.to_string(), pool.clone());
    Ok(pool)
}

fn first_message(pool: &DescriptorPool) -> Result<MessageDescriptor> {
    pool.files()
        .next()
        .and_then(|file| file.messages().next())
        .ok_or_else(|| {
            RegistryError::InvalidSchema("no message type found in schema".to_string())
        })
}

pub fn validate(text: &str) -> Result<()> {
    pool(text).map(|_| ())
}

pub fn serialize(value: &Value, schema_text: &str) -> Result<Vec<u8>> {
    let pool = pool(schema_text)?;
    let md = first_message(&pool)?;
    let message = DynamicMessage::deserialize(md, value.clone())
        .map_err(|e| RegistryError::BadRequest(format!("protobuf encode: {e}")))?;
    Ok(message.encode_to_vec())
}

pub fn deserialize(data: &[u8], schema_text: &str) -> Result<Value> {
    let pool = pool(schema_text)?;
    let md = first_message(&pool)?;
    let message = DynamicMessage::decode(md, data)
        .map_err(|e| RegistryError::BadRequest(format!("protobuf decode: {e}")))?;
    serde_json::to_value(&message)
        .map_err(|e| RegistryError::Internal(format!("protobuf to json: {e}")))
}

pub fn check_compatibility(
    old_text: &str,
    new_text: &str,
    level: CompatibilityLevel,
) -> Result<CompatCheck> {
    let old_pool = pool(old_text)?;
    let new_pool = pool(new_text)?;
    if wants_backward(level) {
        if let Some(reason) = file_incompat(&old_pool, &new_pool) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    if wants_forward(level) {
        if let Some(reason) = file_incompat(&new_pool, &old_pool) {
            return Ok(CompatCheck::broken(reason));
        }
    }
    Ok(CompatCheck::ok())
}

/// Compares the first message type of each file descriptor: the positional
/// slot the payload codec binds to, matching `first_message`. Names do not
/// matter; further top-level messages are unreachable from the codec and
/// never compared.
fn file_incompat(writer: &DescriptorPool, reader: &DescriptorPool) -> Option<String> {
    let Ok(writer_msg) = first_message(writer) else {
        return None;
    };
    let Ok(reader_msg) = first_message(reader) else {
        return Some("reader schema defines no message type".to_string());
    };
    message_incompat(&writer_msg, &reader_msg)
}

/// Fields are keyed by number, never by name; a reader must resolve every
/// writer field with a promotable kind and identical cardinality.
fn message_incompat(writer: &MessageDescriptor, reader: &MessageDescriptor) -> Option<String> {
    for writer_field in writer.fields() {
        let Some(reader_field) = reader.get_field(writer_field.number()) else {
            return Some(format!(
                "field {} (number {}) removed in new schema",
                writer_field.name(),
                writer_field.number()
            ));
        };
        if writer_field.cardinality() != reader_field.cardinality() {
            return Some(format!(
                "cardinality change for field {} (number {})",
                writer_field.name(),
                writer_field.number()
            ));
        }
        match (writer_field.kind(), reader_field.kind()) {
            (Kind::Message(writer_inner), Kind::Message(reader_inner)) => {
                if let Some(reason) = message_incompat(&writer_inner, &reader_inner) {
                    return Some(reason);
                }
            }
            (writer_kind, reader_kind) => {
                if !kind_promotable(&writer_kind, &reader_kind) {
                    return Some(format!(
                        "incompatible type change for field {} (number {})",
                        writer_field.name(),
                        writer_field.number()
                    ));
                }
            }
        }
    }
    None
}

/// Integer families widen within the same sign and wire encoding; `string`
/// and `bytes` pair; everything else matches itself only.
fn kind_promotable(from: &Kind, to: &Kind) -> bool {
    match (from, to) {
        (Kind::Double, Kind::Double) => true,
        (Kind::Float, Kind::Float | Kind::Double) => true,
        (Kind::Int32, Kind::Int32 | Kind::Int64) => true,
        (Kind::Int64, Kind::Int64) => true,
        (Kind::Uint32, Kind::Uint32 | Kind::Uint64) => true,
        (Kind::Uint64, Kind::Uint64) => true,
        (Kind::Sint32, Kind::Sint32 | Kind::Sint64) => true,
        (Kind::Sint64, Kind::Sint64) => true,
        (Kind::Fixed32, Kind::Fixed32) => true,
        (Kind::Fixed64, Kind::Fixed64) => true,
        (Kind::Sfixed32, Kind::Sfixed32) => true,
        (Kind::Sfixed64, Kind::Sfixed64) => true,
        (Kind::Bool, Kind::Bool) => true,
        (Kind::String, Kind::String | Kind::Bytes) => true,
        (Kind::Bytes, Kind::Bytes | Kind::String) => true,
        (Kind::Enum(from_enum), Kind::Enum(to_enum)) => from_enum
            .values()
            .all(|v| to_enum.get_value(v.number()).is_some()),
        _ => false,
    }
}
