use thiserror::Error;

use crate::storage::StoreError;

/// Error kinds surfaced by the registry.
///
/// Mapping to HTTP status codes is the REST layer's concern; the registry
/// itself only distinguishes kinds and carries the human-readable reason.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The schema text does not parse under its declared format.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The compatibility engine rejected the proposed evolution.
    #[error("incompatible schema: {0}")]
    Incompatible(String),

    /// Schema ID, subject, or version is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input: unknown level, non-numeric version, bad envelope.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The store is neither reachable nor a fallback acceptable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The same subject/version was produced twice. Should not occur under
    /// the registry invariants; raised defensively.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::KeyNotFound(key) => RegistryError::NotFound(key),
            StoreError::Unavailable(reason) => RegistryError::StorageUnavailable(reason),
            StoreError::WatchUnsupported => {
                RegistryError::Internal("store does not support watches".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Internal(format!("decode stored schema: {err}"))
    }
}
