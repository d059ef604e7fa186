//! Versioned key-value storage contract consumed by the registry.
//!
//! The real distributed store is an external dependency; the registry only
//! relies on the operations below. [`MemoryKeyValue`] implements the same
//! contract in-process and backs both test mode and the degraded fallback
//! when no external store is reachable.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

mod memory;

pub use memory::MemoryKeyValue;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("watch not supported")]
    WatchUnsupported,
}

/// A key paired with its current value and revision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchOp {
    Put,
    Delete,
}

/// A committed change observed through [`KeyValueStore::watch_all`].
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub key: String,
    /// Present for puts, absent for deletes.
    pub value: Option<Vec<u8>>,
    pub op: WatchOp,
    pub revision: u64,
}

pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Minimal versioned key-value store.
///
/// `put` is last-writer-wins; revisions increase monotonically per bucket.
/// The watch stream delivers the latest state of every live key followed by
/// every subsequent committed change. It may coalesce intermediate states but
/// must not lose the latest state of any key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Bucket name, for diagnostics.
    fn bucket(&self) -> &str;

    async fn get(&self, key: &str) -> Result<KvEntry, StoreError>;

    /// Stores `value` under `key`, returning the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every currently live key, in no particular order.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Opens a stream over all committed changes in this bucket.
    ///
    /// Returns [`StoreError::WatchUnsupported`] for backends without change
    /// feeds; callers must then operate without cross-process coherence.
    fn watch_all(&self) -> Result<WatchStream, StoreError>;
}
