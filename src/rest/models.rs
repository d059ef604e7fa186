use serde::{Deserialize, Serialize};

use crate::model::{Schema, SchemaReference, SchemaType};

/// Payload for registering or looking up schemas.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SchemaRequest {
    #[serde(rename = "schema")]
    pub schema: String,
    /// Defaults to `AVRO` when omitted.
    #[serde(rename = "schemaType", default)]
    pub schema_type: Option<String>,
    #[serde(rename = "references", default)]
    pub references: Option<Vec<SchemaReference>>,
}

/// A stored schema record, as returned by version lookups.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaRecord {
    #[serde(rename = "schema")]
    pub schema: String,
    #[serde(rename = "subject")]
    pub subject: String,
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "id")]
    pub id: i32,
    /// Omitted for the default type (Avro).
    #[serde(rename = "schemaType", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
}

impl From<Schema> for SchemaRecord {
    fn from(schema: Schema) -> Self {
        SchemaRecord {
            schema: schema.schema,
            subject: schema.subject,
            version: schema.version,
            id: schema.id,
            schema_type: (schema.schema_type != SchemaType::Avro)
                .then(|| schema.schema_type.to_string()),
        }
    }
}

/// Returned by a successful registration.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaResponse {
    #[serde(rename = "id")]
    pub id: i32,
}

/// Body of `GET /schemas/ids/{id}`.
#[derive(Clone, Debug, Serialize)]
pub struct SchemaTextResponse {
    #[serde(rename = "schema")]
    pub schema: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompatibilityResponse {
    #[serde(rename = "is_compatible")]
    pub is_compatible: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConfigRequest {
    #[serde(rename = "compatibility")]
    pub compatibility: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfigResponse {
    #[serde(rename = "compatibilityLevel")]
    pub compatibility_level: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "error_code")]
    pub error_code: i32,
    #[serde(rename = "message")]
    pub message: String,
}

/// Query parameters for the lookup endpoint.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct LookupQuery {
    #[serde(default)]
    pub normalize: bool,
}
