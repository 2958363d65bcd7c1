//! In-memory store implementations with the same semantics as the
//! Redis ones. Used by tests and by embedded single-process setups.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::errors::{EngineError, Result};

use super::{data_namespace, state_namespace, DataStore, StateStore};

/// Shared backing maps. Clones are handles onto the same storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    strings: Arc<DashMap<String, String>>,
    blobs: Arc<DashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of string keys currently live, across all namespaces.
    pub fn state_key_count(&self) -> usize {
        self.strings.len()
    }

    /// Number of blob keys currently live, across all namespaces.
    pub fn data_key_count(&self) -> usize {
        self.blobs.len()
    }
}

pub struct MemoryStateStore {
    key_path: String,
    backend: MemoryBackend,
}

impl MemoryStateStore {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            key_path: String::new(),
            backend,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{key}", self.key_path)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn configure(&mut self, flow_name: &str, request_id: &str) {
        self.key_path = state_namespace(flow_name, request_id);
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.strings.insert(self.full_key(key), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        let full = self.full_key(key);
        self.backend
            .strings
            .get(&full)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::StoreNotFound { key: full })
    }

    async fn update(&self, key: &str, old: &str, new: &str) -> Result<()> {
        let full = self.full_key(key);
        match self.backend.strings.entry(full.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get() == old {
                    entry.insert(new.to_string());
                    Ok(())
                } else {
                    Err(EngineError::StoreMismatch { key: full })
                }
            }
            Entry::Vacant(_) => Err(EngineError::StoreNotFound { key: full }),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let full = self.full_key(key);
        let mut entry = self
            .backend
            .strings
            .entry(full.clone())
            .or_insert_with(|| "0".to_string());
        let current: i64 = entry
            .value()
            .parse()
            .map_err(|_| EngineError::StoreCorrupt { key: full })?;
        let next = current + delta;
        *entry.value_mut() = next.to_string();
        Ok(next)
    }

    async fn cleanup(&self) -> Result<()> {
        let prefix = format!("{}.", self.key_path);
        self.backend.strings.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn copy_store(&self) -> Box<dyn StateStore> {
        Box::new(Self {
            key_path: self.key_path.clone(),
            backend: self.backend.clone(),
        })
    }
}

pub struct MemoryDataStore {
    bucket: String,
    backend: MemoryBackend,
}

impl MemoryDataStore {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            bucket: String::new(),
            backend,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{key}.value", self.bucket)
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    fn configure(&mut self, flow_name: &str, request_id: &str) {
        self.bucket = data_namespace(flow_name, request_id);
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.backend.blobs.insert(self.full_key(key), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full = self.full_key(key);
        self.backend
            .blobs
            .get(&full)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::StoreNotFound { key: full })
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.backend.blobs.remove(&self.full_key(key));
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let prefix = format!("{}.", self.bucket);
        self.backend.blobs.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn copy_store(&self) -> Box<dyn DataStore> {
        Box::new(Self {
            bucket: self.bucket.clone(),
            backend: self.backend.clone(),
        })
    }
}
