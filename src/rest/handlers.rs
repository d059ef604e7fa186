use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;

use super::models::{
    CompatibilityResponse, ConfigRequest, ConfigResponse, LookupQuery, SchemaRecord,
    SchemaRequest, SchemaResponse, SchemaTextResponse,
};
use super::{ApiError, ApiJson, AppState};
use crate::error::RegistryError;
use crate::model::{CompatibilityLevel, SchemaType};
use crate::registry::{VersionSpec, GLOBAL_SCOPE};

type Handler<T> = Result<ApiJson<T>, ApiError>;

fn request_body(body: Result<Json<SchemaRequest>, JsonRejection>) -> Result<SchemaRequest, ApiError> {
    let Json(req) = body.map_err(|_| RegistryError::BadRequest("invalid JSON".to_string()))?;
    Ok(req)
}

fn request_schema_type(req: &SchemaRequest) -> Result<SchemaType, ApiError> {
    match req.schema_type.as_deref() {
        None | Some("") => Ok(SchemaType::default()),
        Some(name) => Ok(name.parse()?),
    }
}

pub(super) async fn list_subjects(State(state): State<AppState>) -> Handler<Vec<String>> {
    Ok(ApiJson(state.registry.subjects().await?))
}

pub(super) async fn list_versions(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Handler<Vec<i32>> {
    Ok(ApiJson(state.registry.get_versions(&subject).await?))
}

pub(super) async fn register_schema(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    body: Result<Json<SchemaRequest>, JsonRejection>,
) -> Handler<SchemaResponse> {
    let req = request_body(body)?;
    let schema_type = request_schema_type(&req)?;
    let id = state
        .registry
        .register(&subject, &req.schema, schema_type, req.references)
        .await?;
    Ok(ApiJson(SchemaResponse { id }))
}

pub(super) async fn get_schema_by_version(
    State(state): State<AppState>,
    Path((subject, version)): Path<(String, String)>,
) -> Handler<SchemaRecord> {
    let spec = VersionSpec::parse(&version)?;
    let schema = state
        .registry
        .get_schema_by_subject_version(&subject, spec)
        .await?;
    Ok(ApiJson(schema.into()))
}

pub(super) async fn delete_schema_version(
    State(state): State<AppState>,
    Path((subject, version)): Path<(String, String)>,
) -> Handler<i32> {
    let spec = VersionSpec::parse(&version)?;
    let deleted = state.registry.delete_schema_version(&subject, spec).await?;
    Ok(ApiJson(deleted))
}

pub(super) async fn delete_subject(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Handler<Vec<i32>> {
    Ok(ApiJson(state.registry.delete_subject(&subject).await?))
}

pub(super) async fn lookup_schema(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    Query(query): Query<LookupQuery>,
    body: Result<Json<SchemaRequest>, JsonRejection>,
) -> Handler<SchemaRecord> {
    let req = request_body(body)?;
    let schema_type = request_schema_type(&req)?;
    let schema = state
        .registry
        .lookup_schema(&subject, &req.schema, schema_type, query.normalize)
        .await?;
    Ok(ApiJson(schema.into()))
}

pub(super) async fn get_schema_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Handler<SchemaTextResponse> {
    let id: i32 = id
        .parse()
        .map_err(|_| RegistryError::BadRequest(format!("invalid schema ID: {id}")))?;
    let schema = state.registry.get_schema(id).await?;
    Ok(ApiJson(SchemaTextResponse {
        schema: schema.schema,
    }))
}

pub(super) async fn check_compatibility_subject(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    body: Result<Json<SchemaRequest>, JsonRejection>,
) -> Handler<CompatibilityResponse> {
    let req = request_body(body)?;
    let schema_type = request_schema_type(&req)?;
    let level = state.registry.compatibility_level(&subject).await?;
    let is_compatible = state
        .registry
        .check_compatibility(&subject, &req.schema, schema_type, level)
        .await?;
    Ok(ApiJson(CompatibilityResponse { is_compatible }))
}

pub(super) async fn check_compatibility_version(
    State(state): State<AppState>,
    Path((subject, version)): Path<(String, String)>,
    body: Result<Json<SchemaRequest>, JsonRejection>,
) -> Handler<CompatibilityResponse> {
    let req = request_body(body)?;
    let schema_type = request_schema_type(&req)?;
    let level = state.registry.compatibility_level(&subject).await?;
    let is_compatible = match VersionSpec::parse(&version)? {
        VersionSpec::Latest => {
            state
                .registry
                .check_compatibility(&subject, &req.schema, schema_type, level)
                .await?
        }
        VersionSpec::Number(version) => {
            state
                .registry
                .check_compatibility_with_version(&subject, &req.schema, schema_type, level, version)
                .await?
        }
    };
    Ok(ApiJson(CompatibilityResponse { is_compatible }))
}

pub(super) async fn get_global_config(State(state): State<AppState>) -> Handler<ConfigResponse> {
    let level = state.registry.compatibility_level(GLOBAL_SCOPE).await?;
    Ok(ApiJson(ConfigResponse {
        compatibility_level: level.to_string(),
    }))
}

pub(super) async fn update_global_config(
    State(state): State<AppState>,
    body: Result<Json<ConfigRequest>, JsonRejection>,
) -> Handler<ConfigResponse> {
    let Json(req) = body.map_err(|_| RegistryError::BadRequest("invalid JSON".to_string()))?;
    let level: CompatibilityLevel = req.compatibility.parse()?;
    state
        .registry
        .set_compatibility_level(GLOBAL_SCOPE, level)
        .await?;
    Ok(ApiJson(ConfigResponse {
        compatibility_level: level.to_string(),
    }))
}

pub(super) async fn get_subject_config(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Handler<ConfigResponse> {
    let level = state.registry.compatibility_level(&subject).await?;
    Ok(ApiJson(ConfigResponse {
        compatibility_level: level.to_string(),
    }))
}

pub(super) async fn update_subject_config(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    body: Result<Json<ConfigRequest>, JsonRejection>,
) -> Handler<ConfigResponse> {
    let Json(req) = body.map_err(|_| RegistryError::BadRequest("invalid JSON".to_string()))?;
    let level: CompatibilityLevel = req.compatibility.parse()?;
    state
        .registry
        .set_compatibility_level(&subject, level)
        .await?;
    Ok(ApiJson(ConfigResponse {
        compatibility_level: level.to_string(),
    }))
}
