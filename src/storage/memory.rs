use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{KeyValueStore, KvEntry, StoreError, WatchEvent, WatchOp, WatchStream};

/// In-memory implementation of the store contract.
///
/// A watcher registered through [`KeyValueStore::watch_all`] first receives
/// the current value of every live key, then live updates; snapshot and
/// subscription happen under one lock so no committed change is missed or
/// reordered. [`MemoryKeyValue::without_watch`] disables the change feed,
/// reproducing the degraded fallback mode where the registry runs without
/// cross-process coherence.
pub struct MemoryKeyValue {
    name: String,
    watchable: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    data: BTreeMap<String, (Vec<u8>, u64)>,
    revision: u64,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent>>,
}

impl MemoryKeyValue {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryKeyValue {
            name: name.into(),
            watchable: true,
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                watchers: Vec::new(),
            }),
        }
    }

    /// A store whose `watch_all` reports [`StoreError::WatchUnsupported`].
    pub fn without_watch(name: impl Into<String>) -> Self {
        MemoryKeyValue {
            watchable: false,
            ..MemoryKeyValue::new(name)
        }
    }
}

impl Inner {
    fn broadcast(&mut self, event: WatchEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValue {
    fn bucket(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<KvEntry, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        match inner.data.get(key) {
            Some((value, revision)) => Ok(KvEntry {
                key: key.to_string(),
                value: value.clone(),
                revision: *revision,
            }),
            None => Err(StoreError::KeyNotFound(key.to_string())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.revision += 1;
        let revision = inner.revision;
        inner.data.insert(key.to_string(), (value.clone(), revision));
        inner.broadcast(WatchEvent {
            key: key.to_string(),
            value: Some(value),
            op: WatchOp::Put,
            revision,
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if inner.data.remove(key).is_none() {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.broadcast(WatchEvent {
            key: key.to_string(),
            value: None,
            op: WatchOp::Delete,
            revision,
        });
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.data.keys().cloned().collect())
    }

    fn watch_all(&self) -> Result<WatchStream, StoreError> {
        if !self.watchable {
            return Err(StoreError::WatchUnsupported);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            // Replay current state before going live; done under the lock so
            // a concurrent put cannot slip between snapshot and subscription.
            for (key, (value, revision)) in inner.data.iter() {
                let _ = tx.send(WatchEvent {
                    key: key.clone(),
                    value: Some(value.clone()),
                    op: WatchOp::Put,
                    revision: *revision,
                });
            }
            inner.watchers.push(tx);
        }
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}
