//! Confluent-compatible HTTP surface over the registry.
//!
//! The registry handle is injected as router state; responses use the
//! `application/vnd.schemaregistry.v1+json` content type and errors
//! serialize as `{error_code, message}`.

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::error::RegistryError;
use crate::registry::Registry;

mod handlers;
pub mod models;

pub const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Builds the route table of the registry API.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/subjects", get(handlers::list_subjects))
        .route(
            "/subjects/:subject",
            post(handlers::lookup_schema).delete(handlers::delete_subject),
        )
        .route(
            "/subjects/:subject/versions",
            get(handlers::list_versions).post(handlers::register_schema),
        )
        .route(
            "/subjects/:subject/versions/:version",
            get(handlers::get_schema_by_version).delete(handlers::delete_schema_version),
        )
        .route("/schemas/ids/:id", get(handlers::get_schema_by_id))
        .route(
            "/compatibility/subjects/:subject/versions",
            post(handlers::check_compatibility_subject),
        )
        .route(
            "/compatibility/subjects/:subject/versions/:version",
            post(handlers::check_compatibility_version),
        )
        .route(
            "/config",
            get(handlers::get_global_config).put(handlers::update_global_config),
        )
        .route(
            "/config/:subject",
            get(handlers::get_subject_config).put(handlers::update_subject_config),
        )
        .with_state(AppState { registry })
}

/// JSON response carrying the registry content type.
pub struct ApiJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => ApiError(RegistryError::Internal(format!("encode response: {e}")))
                .into_response(),
        }
    }
}

/// Registry error rendered as `{error_code, message}`.
pub struct ApiError(pub RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, i32) {
        match &self.0 {
            RegistryError::InvalidSchema(_) => (StatusCode::UNPROCESSABLE_ENTITY, 42201),
            RegistryError::BadRequest(_) => (StatusCode::BAD_REQUEST, 42201),
            RegistryError::Incompatible(_) => (StatusCode::CONFLICT, 40901),
            RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, 40401),
            RegistryError::StorageUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, 50300),
            RegistryError::Conflict(_) => (StatusCode::CONFLICT, 40902),
            RegistryError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, 50001),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        let body = models::ErrorResponse {
            error_code,
            message: self.0.to_string(),
        };
        let body = serde_json::to_vec(&body).unwrap_or_default();
        (status, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
    }
}
