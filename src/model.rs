use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Format of a stored schema.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SchemaType {
    #[default]
    #[serde(rename = "AVRO")]
    Avro,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "PROTOBUF")]
    Protobuf,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaType::Avro => write!(f, "AVRO"),
            SchemaType::Json => write!(f, "JSON"),
            SchemaType::Protobuf => write!(f, "PROTOBUF"),
        }
    }
}

impl FromStr for SchemaType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVRO" => Ok(SchemaType::Avro),
            "JSON" => Ok(SchemaType::Json),
            "PROTOBUF" => Ok(SchemaType::Protobuf),
            other => Err(RegistryError::BadRequest(format!(
                "unsupported schema type: {other}"
            ))),
        }
    }
}

/// Policy controlling which evolutions of a subject are permitted.
///
/// The transitive variants are checked against every prior version of the
/// subject; the base variants only against the latest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CompatibilityLevel {
    #[default]
    #[serde(rename = "BACKWARD")]
    Backward,
    #[serde(rename = "FORWARD")]
    Forward,
    #[serde(rename = "FULL")]
    Full,
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "BACKWARD_TRANSITIVE")]
    BackwardTransitive,
    #[serde(rename = "FORWARD_TRANSITIVE")]
    ForwardTransitive,
    #[serde(rename = "FULL_TRANSITIVE")]
    FullTransitive,
}

impl CompatibilityLevel {
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            CompatibilityLevel::BackwardTransitive
                | CompatibilityLevel::ForwardTransitive
                | CompatibilityLevel::FullTransitive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityLevel::Backward => "BACKWARD",
            CompatibilityLevel::Forward => "FORWARD",
            CompatibilityLevel::Full => "FULL",
            CompatibilityLevel::None => "NONE",
            CompatibilityLevel::BackwardTransitive => "BACKWARD_TRANSITIVE",
            CompatibilityLevel::ForwardTransitive => "FORWARD_TRANSITIVE",
            CompatibilityLevel::FullTransitive => "FULL_TRANSITIVE",
        }
    }
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompatibilityLevel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKWARD" => Ok(CompatibilityLevel::Backward),
            "FORWARD" => Ok(CompatibilityLevel::Forward),
            "FULL" => Ok(CompatibilityLevel::Full),
            "NONE" => Ok(CompatibilityLevel::None),
            "BACKWARD_TRANSITIVE" => Ok(CompatibilityLevel::BackwardTransitive),
            "FORWARD_TRANSITIVE" => Ok(CompatibilityLevel::ForwardTransitive),
            "FULL_TRANSITIVE" => Ok(CompatibilityLevel::FullTransitive),
            other => Err(RegistryError::BadRequest(format!(
                "invalid compatibility level: {other}"
            ))),
        }
    }
}

/// Reference to another registered schema.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SchemaReference {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "subject")]
    pub subject: String,
    #[serde(rename = "version")]
    pub version: i32,
}

/// A registered schema as persisted in the store.
///
/// The by-ID entry and the subject/version entry for the same logical schema
/// carry this exact payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The schema payload, verbatim.
    #[serde(rename = "schema")]
    pub schema: String,
    #[serde(rename = "subject")]
    pub subject: String,
    #[serde(rename = "version")]
    pub version: i32,
    /// Globally unique across all subjects.
    #[serde(rename = "id")]
    pub id: i32,
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(rename = "references", skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<SchemaReference>>,
}
