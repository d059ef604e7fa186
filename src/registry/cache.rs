//! The registry's in-process read caches.
//!
//! Four maps behind one coarse lock: schemas by ID, the ascending version
//! list per subject, the version-to-ID index per subject, and resolved
//! compatibility levels. Reads install entries on miss; KV writes never touch
//! the caches directly; they invalidate, and the watch loop reflects the
//! committed state back.

use std::collections::HashMap;

use tracing::warn;

use super::keys;
use crate::model::{CompatibilityLevel, Schema};
use crate::storage::{WatchEvent, WatchOp};

#[derive(Default)]
pub(crate) struct CacheLayer {
    schema_by_id: HashMap<i32, Schema>,
    versions_by_subject: HashMap<String, Vec<i32>>,
    id_by_version: HashMap<String, HashMap<i32, i32>>,
    config_level: HashMap<String, CompatibilityLevel>,
}

impl CacheLayer {
    pub fn new() -> Self {
        CacheLayer::default()
    }

    pub fn schema(&self, id: i32) -> Option<Schema> {
        self.schema_by_id.get(&id).cloned()
    }

    pub fn insert_schema(&mut self, schema: Schema) {
        self.schema_by_id.insert(schema.id, schema);
    }

    pub fn remove_schema(&mut self, id: i32) {
        self.schema_by_id.remove(&id);
    }

    pub fn versions(&self, subject: &str) -> Option<Vec<i32>> {
        self.versions_by_subject.get(subject).cloned()
    }

    pub fn set_versions(&mut self, subject: &str, versions: Vec<i32>) {
        self.versions_by_subject.insert(subject.to_string(), versions);
    }

    pub fn version_id(&self, subject: &str, version: i32) -> Option<i32> {
        self.id_by_version.get(subject)?.get(&version).copied()
    }

    pub fn insert_version(&mut self, subject: &str, version: i32, id: i32) {
        self.id_by_version
            .entry(subject.to_string())
            .or_default()
            .insert(version, id);
        let versions = self.versions_by_subject.entry(subject.to_string()).or_default();
        if let Err(at) = versions.binary_search(&version) {
            versions.insert(at, version);
        }
    }

    pub fn remove_version(&mut self, subject: &str, version: i32) {
        if let Some(ids) = self.id_by_version.get_mut(subject) {
            ids.remove(&version);
            if ids.is_empty() {
                self.id_by_version.remove(subject);
            }
        }
        if let Some(versions) = self.versions_by_subject.get_mut(subject) {
            versions.retain(|&v| v != version);
            if versions.is_empty() {
                self.versions_by_subject.remove(subject);
            }
        }
    }

    pub fn invalidate_subject(&mut self, subject: &str) {
        self.versions_by_subject.remove(subject);
        self.id_by_version.remove(subject);
    }

    pub fn level(&self, scope: &str) -> Option<CompatibilityLevel> {
        self.config_level.get(scope).copied()
    }

    pub fn set_level(&mut self, scope: &str, level: CompatibilityLevel) {
        self.config_level.insert(scope.to_string(), level);
    }

    pub fn remove_level(&mut self, scope: &str) {
        self.config_level.remove(scope);
    }

    /// Applies a change event from the schemas bucket.
    pub fn apply_schema_event(&mut self, event: &WatchEvent) {
        match event.op {
            WatchOp::Delete => {
                if let Some(id) = keys::parse_schema_key(&event.key) {
                    self.remove_schema(id);
                } else if let Some((subject, version)) = keys::parse_version_key(&event.key) {
                    let subject = subject.to_string();
                    self.remove_version(&subject, version);
                }
            }
            WatchOp::Put => {
                let is_schema_key = keys::parse_schema_key(&event.key).is_some();
                let version_coords = keys::parse_version_key(&event.key)
                    .map(|(subject, version)| (subject.to_string(), version));
                if !is_schema_key && version_coords.is_none() {
                    return;
                }
                let Some(value) = event.value.as_deref() else {
                    return;
                };
                let schema: Schema = match serde_json::from_slice(value) {
                    Ok(schema) => schema,
                    Err(error) => {
                        warn!(key = %event.key, %error, "ignoring undecodable schema update");
                        return;
                    }
                };
                if is_schema_key {
                    self.insert_schema(schema);
                } else if let Some((subject, version)) = version_coords {
                    self.insert_version(&subject, version, schema.id);
                }
            }
        }
    }

    /// Applies a change event from the config bucket.
    pub fn apply_config_event(&mut self, event: &WatchEvent) {
        let scope = if event.key == keys::GLOBAL_CONFIG_KEY {
            keys::GLOBAL_SCOPE
        } else if let Some(subject) = event.key.strip_prefix(keys::SUBJECT_CONFIG_PREFIX) {
            subject
        } else {
            return;
        };
        match event.op {
            WatchOp::Delete => self.remove_level(scope),
            WatchOp::Put => {
                let parsed = event
                    .value
                    .as_deref()
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .and_then(|s| s.parse::<CompatibilityLevel>().ok());
                match parsed {
                    Some(level) => self.set_level(scope, level),
                    None => {
                        warn!(key = %event.key, "ignoring undecodable config update");
                        self.remove_level(scope);
                    }
                }
            }
        }
    }
}
