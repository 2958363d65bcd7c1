//! Per-request durable storage.
//!
//! Two stores back every request: a [`StateStore`] of small string
//! values with compare-and-set and atomic increment (progress counters,
//! node states, the phase), and a [`DataStore`] of opaque blobs (node
//! inputs and outputs). Both are namespaced per `(flow, request)`; a
//! runtime holds an unconfigured prototype and hands each request a
//! scoped handle via `copy_store` + `configure`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

mod memory;
mod redis;

pub use memory::{MemoryBackend, MemoryDataStore, MemoryStateStore};
pub use redis::{RedisDataStore, RedisStateStore};

/// Key namespace of a request's state entries.
pub fn state_namespace(flow_name: &str, request_id: &str) -> String {
    format!("core.{flow_name}.{request_id}")
}

/// Key namespace (bucket) of a request's data blobs.
pub fn data_namespace(flow_name: &str, request_id: &str) -> String {
    format!("core-{flow_name}-{request_id}")
}

/// Small-value store with linearizable per-key CAS and atomic counters.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Binds the handle to the `core.<flow>.<request>` namespace.
    fn configure(&mut self, flow_name: &str, request_id: &str);

    /// Called once per request before first use.
    async fn init(&self) -> Result<()>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Fails with `StoreNotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<String>;

    /// Compare-and-set. `StoreMismatch` when the current value differs
    /// from `old`, `StoreNotFound` when the key is absent.
    async fn update(&self, key: &str, old: &str, new: &str) -> Result<()>;

    /// Atomic add; missing keys count from zero. Returns the new value.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Deletes every key under the namespace. Idempotent.
    async fn cleanup(&self) -> Result<()>;

    /// A new unconfigured handle sharing the backing client.
    fn copy_store(&self) -> Box<dyn StateStore>;
}

/// Opaque blob store. No ordering or atomicity across keys.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Binds the handle to the `core-<flow>-<request>` bucket.
    fn configure(&mut self, flow_name: &str, request_id: &str);

    async fn init(&self) -> Result<()>;

    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn cleanup(&self) -> Result<()>;

    fn copy_store(&self) -> Box<dyn DataStore>;
}
