//! The registry state machine: versioned registration with compatibility
//! gating, ID allocation, cached reads, and the watch-driven invalidation
//! loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::formats;
use crate::model::{CompatibilityLevel, Schema, SchemaReference, SchemaType};
use crate::storage::{KeyValueStore, StoreError, WatchStream};
use crate::wire;

mod cache;
mod keys;

use cache::CacheLayer;
pub use keys::GLOBAL_SCOPE;

/// Version selector accepted by the lookup and delete operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionSpec {
    Latest,
    Number(i32),
}

impl VersionSpec {
    /// Parses the path form: `"latest"` or a positive integer.
    pub fn parse(s: &str) -> Result<VersionSpec> {
        if s == "latest" {
            return Ok(VersionSpec::Latest);
        }
        match s.parse::<i32>() {
            Ok(n) if n > 0 => Ok(VersionSpec::Number(n)),
            _ => Err(RegistryError::BadRequest(format!("invalid version: {s}"))),
        }
    }
}

pub struct Registry {
    kv_schemas: Arc<dyn KeyValueStore>,
    kv_config: Arc<dyn KeyValueStore>,
    caches: Arc<RwLock<CacheLayer>>,
    /// Serializes the write path so version and ID allocation are race-free
    /// within the process. Cache reads take the shared lock only.
    write_lock: tokio::sync::Mutex<()>,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Creates a registry over the two buckets and starts the watch loop.
    ///
    /// Must be called from within a tokio runtime. Readiness is reported via
    /// [`Registry::wait_ready`] once watches on both buckets are live; for a
    /// store without watch support the registry is immediately ready and runs
    /// without cross-process cache coherence.
    pub fn new(kv_schemas: Arc<dyn KeyValueStore>, kv_config: Arc<dyn KeyValueStore>) -> Registry {
        let caches = Arc::new(RwLock::new(CacheLayer::new()));
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(watch_loop(
            kv_schemas.clone(),
            kv_config.clone(),
            caches.clone(),
            ready_tx,
            shutdown_rx,
        ));
        Registry {
            kv_schemas,
            kv_config,
            caches,
            write_lock: tokio::sync::Mutex::new(()),
            ready_rx,
            shutdown_tx,
            watch_task: Mutex::new(Some(task)),
        }
    }

    /// Blocks until the watch loop is live, or fails after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| RegistryError::Internal("watch loop exited".to_string()))?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RegistryError::Internal("registry not ready within deadline".to_string()))?
    }

    /// Stops the watch loop and waits for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.watch_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Registers `text` under `subject`, returning the schema ID.
    ///
    /// Re-registering the subject's latest text is idempotent and returns the
    /// existing ID without creating a version. Content identical to any other
    /// registered schema reuses that schema's ID under a fresh version.
    pub async fn register(
        &self,
        subject: &str,
        text: &str,
        schema_type: SchemaType,
        references: Option<Vec<SchemaReference>>,
    ) -> Result<i32> {
        formats::validate(schema_type, text)?;

        let _guard = self.write_lock.lock().await;

        let versions = self.load_versions(subject).await?;
        let latest = versions.last().copied().unwrap_or(0);
        if latest > 0 {
            let latest_schema = self.schema_by_version(subject, latest).await?;
            if latest_schema.schema == text && latest_schema.schema_type == schema_type {
                debug!(subject, id = latest_schema.id, "idempotent re-register");
                return Ok(latest_schema.id);
            }

            let level = self.compatibility_level(subject).await?;
            debug!(subject, %level, latest, "checking compatibility");
            if level != CompatibilityLevel::None {
                if level.is_transitive() {
                    for &version in &versions {
                        let prior = self.schema_by_version(subject, version).await?;
                        ensure_compatible(&prior, text, schema_type, level)?;
                    }
                } else {
                    ensure_compatible(&latest_schema, text, schema_type, level)?;
                }
            }
        }

        let existing_id = self.find_by_content(text, schema_type).await?;
        let new_version = latest + 1;
        let id = match existing_id {
            Some(id) => id,
            None => self.next_schema_id().await?,
        };
        let record = Schema {
            schema: text.to_string(),
            subject: subject.to_string(),
            version: new_version,
            id,
            schema_type,
            references,
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|e| RegistryError::Internal(format!("encode schema: {e}")))?;

        let version_key = keys::version_key(subject, new_version);
        match self.kv_schemas.get(&version_key).await {
            Err(StoreError::KeyNotFound(_)) => {}
            Ok(_) => {
                return Err(RegistryError::Conflict(format!(
                    "version {new_version} already exists for subject {subject}"
                )))
            }
            Err(e) => return Err(e.into()),
        }

        // By-ID entry first: a crash before the second write leaves only an
        // orphan by-ID entry, which is harmless and reusable.
        if existing_id.is_none() {
            self.kv_schemas
                .put(&keys::schema_key(id), payload.clone())
                .await?;
        }
        self.kv_schemas.put(&version_key, payload).await?;

        {
            let mut caches = self.caches.write().unwrap();
            caches.invalidate_subject(subject);
            caches.remove_schema(id);
        }

        info!(subject, version = new_version, id, reused = existing_id.is_some(), "registered schema");
        Ok(id)
    }

    /// Retrieves a schema by its globally unique ID.
    pub async fn get_schema(&self, id: i32) -> Result<Schema> {
        if let Some(schema) = self.caches.read().unwrap().schema(id) {
            return Ok(schema);
        }
        let entry = self.kv_schemas.get(&keys::schema_key(id)).await.map_err(|e| {
            match e {
                StoreError::KeyNotFound(_) => {
                    RegistryError::NotFound(format!("schema not found: {id}"))
                }
                other => other.into(),
            }
        })?;
        let schema: Schema = serde_json::from_slice(&entry.value)?;
        self.caches.write().unwrap().insert_schema(schema.clone());
        Ok(schema)
    }

    /// Retrieves a subject's schema at `version`, resolving `latest`.
    pub async fn get_schema_by_subject_version(
        &self,
        subject: &str,
        version: VersionSpec,
    ) -> Result<Schema> {
        let version = self.resolve_version(subject, version).await?;
        self.schema_by_version(subject, version).await
    }

    /// All versions registered under `subject`, ascending.
    pub async fn get_versions(&self, subject: &str) -> Result<Vec<i32>> {
        let versions = self.load_versions(subject).await?;
        if versions.is_empty() {
            return Err(RegistryError::NotFound(format!(
                "no versions found for subject {subject}"
            )));
        }
        Ok(versions)
    }

    /// Every subject with at least one live version, sorted.
    pub async fn subjects(&self) -> Result<Vec<String>> {
        let kv_keys = self.kv_schemas.keys().await?;
        let mut subjects: Vec<String> = kv_keys
            .iter()
            .filter_map(|key| keys::parse_version_key(key))
            .map(|(subject, _)| subject.to_string())
            .collect();
        subjects.sort_unstable();
        subjects.dedup();
        Ok(subjects)
    }

    /// Effective compatibility level: subject-specific if set, else global,
    /// else the default (`BACKWARD`).
    pub async fn compatibility_level(&self, subject: &str) -> Result<CompatibilityLevel> {
        {
            let caches = self.caches.read().unwrap();
            if let Some(level) = caches.level(subject) {
                return Ok(level);
            }
            if let Some(level) = caches.level(GLOBAL_SCOPE) {
                return Ok(level);
            }
        }

        if subject != GLOBAL_SCOPE {
            match self.kv_config.get(&keys::subject_config_key(subject)).await {
                Ok(entry) => {
                    let level = decode_level(&entry.value);
                    self.caches.write().unwrap().set_level(subject, level);
                    return Ok(level);
                }
                Err(StoreError::KeyNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self.kv_config.get(keys::GLOBAL_CONFIG_KEY).await {
            Ok(entry) => {
                let level = decode_level(&entry.value);
                self.caches.write().unwrap().set_level(GLOBAL_SCOPE, level);
                Ok(level)
            }
            Err(StoreError::KeyNotFound(_)) => Ok(CompatibilityLevel::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the compatibility level for a subject, or globally when
    /// `scope` is [`GLOBAL_SCOPE`].
    pub async fn set_compatibility_level(
        &self,
        scope: &str,
        level: CompatibilityLevel,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = if scope == GLOBAL_SCOPE {
            keys::GLOBAL_CONFIG_KEY.to_string()
        } else {
            keys::subject_config_key(scope)
        };
        self.kv_config
            .put(&key, level.as_str().as_bytes().to_vec())
            .await?;
        self.caches.write().unwrap().remove_level(scope);
        info!(scope, %level, "compatibility level updated");
        Ok(())
    }

    /// Whether `text` is compatible with the subject's history at `level`.
    ///
    /// An empty subject accepts anything. Transitive levels check every prior
    /// version in ascending order; base levels only the latest.
    pub async fn check_compatibility(
        &self,
        subject: &str,
        text: &str,
        schema_type: SchemaType,
        level: CompatibilityLevel,
    ) -> Result<bool> {
        formats::validate(schema_type, text)?;
        let versions = self.load_versions(subject).await?;
        if versions.is_empty() {
            return Ok(true);
        }
        let candidates: &[i32] = if level.is_transitive() {
            &versions
        } else {
            std::slice::from_ref(versions.last().unwrap())
        };
        for &version in candidates {
            let prior = self.schema_by_version(subject, version).await?;
            if prior.schema_type != schema_type {
                return Ok(false);
            }
            let check = formats::check_compatibility(schema_type, &prior.schema, text, level)?;
            if !check.is_compatible {
                debug!(subject, version, reason = ?check.reason, "compatibility check failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Checks `text` pairwise against one specific version of the subject.
    pub async fn check_compatibility_with_version(
        &self,
        subject: &str,
        text: &str,
        schema_type: SchemaType,
        level: CompatibilityLevel,
        version: i32,
    ) -> Result<bool> {
        formats::validate(schema_type, text)?;
        let prior = self.schema_by_version(subject, version).await?;
        if prior.schema_type != schema_type {
            return Ok(false);
        }
        let check = formats::check_compatibility(schema_type, &prior.schema, text, level)?;
        Ok(check.is_compatible)
    }

    /// Removes a single version. The by-ID entry survives, since other
    /// subjects may reference the same ID.
    pub async fn delete_schema_version(
        &self,
        subject: &str,
        version: VersionSpec,
    ) -> Result<i32> {
        let _guard = self.write_lock.lock().await;
        let version = self.resolve_version(subject, version).await?;
        let key = keys::version_key(subject, version);
        match self.kv_schemas.get(&key).await {
            Ok(_) => {}
            Err(StoreError::KeyNotFound(_)) => {
                return Err(RegistryError::NotFound(format!(
                    "version {version} not found for subject {subject}"
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.kv_schemas.delete(&key).await?;
        self.caches.write().unwrap().invalidate_subject(subject);
        info!(subject, version, "deleted schema version");
        Ok(version)
    }

    /// Removes every version of a subject, plus the by-ID entries for IDs no
    /// other subject references. Returns the affected IDs in version order.
    pub async fn delete_subject(&self, subject: &str) -> Result<Vec<i32>> {
        let _guard = self.write_lock.lock().await;
        let versions = self.load_versions(subject).await?;
        if versions.is_empty() {
            return Err(RegistryError::NotFound(format!(
                "subject not found: {subject}"
            )));
        }

        let shared = self.ids_referenced_elsewhere(subject).await?;

        let mut deleted_ids = Vec::new();
        let mut seen = HashSet::new();
        for &version in &versions {
            let key = keys::version_key(subject, version);
            let record = match self.kv_schemas.get(&key).await {
                Ok(entry) => serde_json::from_slice::<Schema>(&entry.value).ok(),
                Err(StoreError::KeyNotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            if let Some(record) = record {
                if seen.insert(record.id) {
                    deleted_ids.push(record.id);
                    if !shared.contains(&record.id) {
                        match self.kv_schemas.delete(&keys::schema_key(record.id)).await {
                            Ok(()) | Err(StoreError::KeyNotFound(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.caches.write().unwrap().remove_schema(record.id);
                }
            }
            self.kv_schemas.delete(&key).await?;
        }

        self.caches.write().unwrap().invalidate_subject(subject);
        info!(subject, ids = ?deleted_ids, "deleted subject");
        Ok(deleted_ids)
    }

    /// Finds the registered version of `text` under `subject`.
    ///
    /// With `normalize`, comparison is on the parsed JSON form of the schema
    /// text instead of raw bytes.
    pub async fn lookup_schema(
        &self,
        subject: &str,
        text: &str,
        schema_type: SchemaType,
        normalize: bool,
    ) -> Result<Schema> {
        formats::validate(schema_type, text)?;
        let versions = self.get_versions(subject).await?;
        let normalized = normalize.then(|| serde_json::from_str::<Value>(text).ok()).flatten();
        for version in versions {
            let record = self.schema_by_version(subject, version).await?;
            if record.schema_type != schema_type {
                continue;
            }
            let matches = if let Some(ref wanted) = normalized {
                serde_json::from_str::<Value>(&record.schema)
                    .map(|found| &found == wanted)
                    .unwrap_or(false)
            } else {
                record.schema == text
            };
            if matches {
                return Ok(record);
            }
        }
        Err(RegistryError::NotFound("schema not found".to_string()))
    }

    /// Encodes `data` under the schema's format and frames it with the wire
    /// envelope.
    pub async fn serialize(&self, data: &Value, schema_id: i32) -> Result<Vec<u8>> {
        let schema = self.get_schema(schema_id).await?;
        let payload = formats::serialize(schema.schema_type, data, &schema.schema)?;
        Ok(wire::encode(schema_id, &payload))
    }

    /// Unframes the wire envelope, resolves the schema, and decodes the
    /// payload.
    pub async fn deserialize(&self, data: &[u8]) -> Result<Value> {
        let (schema_id, payload) = wire::decode(data)?;
        let schema = self.get_schema(schema_id).await?;
        formats::deserialize(schema.schema_type, payload, &schema.schema)
    }

    async fn resolve_version(&self, subject: &str, version: VersionSpec) -> Result<i32> {
        match version {
            VersionSpec::Number(n) => Ok(n),
            VersionSpec::Latest => {
                let versions = self.load_versions(subject).await?;
                versions.last().copied().ok_or_else(|| {
                    RegistryError::NotFound(format!("no versions found for subject {subject}"))
                })
            }
        }
    }

    /// Ascending version list for a subject; empty when the subject does not
    /// exist. Cache-first, installing on miss (non-empty lists only, so a
    /// later registration is not masked by a cached absence).
    async fn load_versions(&self, subject: &str) -> Result<Vec<i32>> {
        if let Some(versions) = self.caches.read().unwrap().versions(subject) {
            return Ok(versions);
        }
        let prefix = keys::version_prefix(subject);
        let kv_keys = self.kv_schemas.keys().await?;
        let mut versions: Vec<i32> = kv_keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str())?.parse().ok())
            .collect();
        versions.sort_unstable();
        if !versions.is_empty() {
            self.caches
                .write()
                .unwrap()
                .set_versions(subject, versions.clone());
        }
        Ok(versions)
    }

    async fn schema_by_version(&self, subject: &str, version: i32) -> Result<Schema> {
        {
            let caches = self.caches.read().unwrap();
            if let Some(schema) = caches
                .version_id(subject, version)
                .and_then(|id| caches.schema(id))
            {
                // The by-ID payload may name the subject that first
                // registered this text; text and format are identical, so
                // report this subject's coordinates.
                return Ok(Schema {
                    subject: subject.to_string(),
                    version,
                    ..schema
                });
            }
        }
        let entry = self
            .kv_schemas
            .get(&keys::version_key(subject, version))
            .await
            .map_err(|e| match e {
                StoreError::KeyNotFound(_) => RegistryError::NotFound(format!(
                    "version {version} not found for subject {subject}"
                )),
                other => other.into(),
            })?;
        let schema: Schema = serde_json::from_slice(&entry.value)?;
        self.caches
            .write()
            .unwrap()
            .insert_version(subject, version, schema.id);
        Ok(schema)
    }

    /// Scans the by-ID entries for a schema with identical text and format.
    async fn find_by_content(&self, text: &str, schema_type: SchemaType) -> Result<Option<i32>> {
        let mut ids: Vec<i32> = self
            .kv_schemas
            .keys()
            .await?
            .iter()
            .filter_map(|key| keys::parse_schema_key(key))
            .collect();
        ids.sort_unstable();
        for id in ids {
            let entry = match self.kv_schemas.get(&keys::schema_key(id)).await {
                Ok(entry) => entry,
                Err(StoreError::KeyNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let Ok(schema) = serde_json::from_slice::<Schema>(&entry.value) else {
                continue;
            };
            if schema.schema == text && schema.schema_type == schema_type {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Allocates the next ID: strictly greater than every ID previously
    /// allocated, not merely every ID still live.
    ///
    /// The live by-ID entries alone cannot guarantee that: deleting the
    /// highest schema would let its ID be reissued for different content.
    /// A high-water key is advanced alongside the scan instead. The mark is
    /// persisted before the schema writes; a crash in between wastes an ID,
    /// nothing more.
    async fn next_schema_id(&self) -> Result<i32> {
        let scanned = self
            .kv_schemas
            .keys()
            .await?
            .iter()
            .filter_map(|key| keys::parse_schema_key(key))
            .max()
            .unwrap_or(0);
        let recorded = match self.kv_schemas.get(keys::ALLOCATOR_KEY).await {
            Ok(entry) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0),
            Err(StoreError::KeyNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        let next = scanned.max(recorded) + 1;
        self.kv_schemas
            .put(keys::ALLOCATOR_KEY, next.to_string().into_bytes())
            .await?;
        Ok(next)
    }

    /// IDs referenced by version entries of subjects other than `subject`.
    async fn ids_referenced_elsewhere(&self, subject: &str) -> Result<HashSet<i32>> {
        let mut shared = HashSet::new();
        for key in self.kv_schemas.keys().await? {
            let Some((owner, _)) = keys::parse_version_key(&key) else {
                continue;
            };
            if owner == subject {
                continue;
            }
            match self.kv_schemas.get(&key).await {
                Ok(entry) => {
                    if let Ok(schema) = serde_json::from_slice::<Schema>(&entry.value) {
                        shared.insert(schema.id);
                    }
                }
                Err(StoreError::KeyNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(shared)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn ensure_compatible(
    prior: &Schema,
    text: &str,
    schema_type: SchemaType,
    level: CompatibilityLevel,
) -> Result<()> {
    if prior.schema_type != schema_type {
        return Err(RegistryError::Incompatible(format!(
            "schema type changed from {} to {}",
            prior.schema_type, schema_type
        )));
    }
    let check = formats::check_compatibility(schema_type, &prior.schema, text, level)?;
    if !check.is_compatible {
        return Err(RegistryError::Incompatible(format!(
            "incompatible with version {}: {}",
            prior.version,
            check.reason.unwrap_or_else(|| "schema evolution rejected".to_string())
        )));
    }
    Ok(())
}

fn decode_level(value: &[u8]) -> CompatibilityLevel {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| {
            warn!("undecodable stored compatibility level, using default");
            CompatibilityLevel::default()
        })
}

/// Long-lived background task: watches both buckets, signals readiness once
/// both watches are live, and applies change events to the caches. Failed
/// watches are re-opened with capped exponential backoff; a store without
/// watch support leaves the registry in read-through-only mode.
async fn watch_loop(
    kv_schemas: Arc<dyn KeyValueStore>,
    kv_config: Arc<dyn KeyValueStore>,
    caches: Arc<RwLock<CacheLayer>>,
    ready_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_millis(100);
    loop {
        let opened: std::result::Result<(WatchStream, WatchStream), StoreError> = kv_schemas
            .watch_all()
            .and_then(|schemas| kv_config.watch_all().map(|config| (schemas, config)));
        let (mut schemas_watch, mut config_watch) = match opened {
            Ok(watches) => watches,
            Err(StoreError::WatchUnsupported) => {
                warn!("store does not support watches; running without cache coherence");
                let _ = ready_tx.send(true);
                return;
            }
            Err(error) => {
                warn!(%error, "failed to open watches, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            }
        };
        backoff = Duration::from_millis(100);
        let _ = ready_tx.send(true);
        debug!("watch loop live");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                event = schemas_watch.next() => match event {
                    Some(event) => caches.write().unwrap().apply_schema_event(&event),
                    None => break,
                },
                event = config_watch.next() => match event {
                    Some(event) => caches.write().unwrap().apply_config_event(&event),
                    None => break,
                },
            }
        }

        warn!("watch stream ended, reopening");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}
