//! Worker and flow announcement.
//!
//! Workers publish their heartbeat JSON and the descriptors of their
//! registered flows under TTL'd keys; observers enumerate live workers
//! and flows by prefix scan, with no explicit deregistration protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::errors::Result;
use crate::model::{flow_key, worker_key, Worker, FLOW_KEY_PREFIX, WORKER_KEY_PREFIX};

/// TTL'd key/value registry shared by every worker in the deployment.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Convenience queries over any registry implementation.
pub struct RegistryView<'a> {
    registry: &'a dyn WorkerRegistry,
}

impl<'a> RegistryView<'a> {
    pub fn new(registry: &'a dyn WorkerRegistry) -> Self {
        Self { registry }
    }

    /// Currently announced workers.
    pub async fn live_workers(&self) -> Result<Vec<Worker>> {
        let entries = self.registry.scan_prefix(WORKER_KEY_PREFIX).await?;
        let mut workers = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            workers.push(serde_json::from_str(&value)?);
        }
        Ok(workers)
    }

    /// Currently announced flow descriptors, `(flow_name, json)`.
    pub async fn live_flows(&self) -> Result<Vec<(String, String)>> {
        let prefix = format!("{FLOW_KEY_PREFIX}:");
        let entries = self.registry.scan_prefix(FLOW_KEY_PREFIX).await?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key.trim_start_matches(&prefix).to_string(), value))
            .collect())
    }
}

/// Writes one heartbeat round: the worker key (present only in worker
/// mode) and every flow descriptor, all with the registry TTL.
pub async fn announce(
    registry: &dyn WorkerRegistry,
    worker: &Worker,
    worker_mode: bool,
    flow_descriptors: &[(String, String)],
    ttl: Duration,
) -> Result<()> {
    if worker_mode {
        let value = serde_json::to_string(worker)?;
        registry.set_with_ttl(&worker_key(&worker.id), &value, ttl).await?;
    } else {
        registry.delete(&worker_key(&worker.id)).await?;
    }
    for (flow_name, descriptor) in flow_descriptors {
        registry.set_with_ttl(&flow_key(flow_name), descriptor, ttl).await?;
    }
    Ok(())
}

pub struct RedisRegistry {
    conn: ConnectionManager,
}

impl RedisRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl WorkerRegistry for RedisRegistry {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let pattern = format!("{prefix}*");
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // A key can expire between SCAN and GET.
            let value: Option<String> = conn.get(&key).await?;
            if let Some(value) = value {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

/// In-memory registry with lazy TTL expiry, for tests and embedded use.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drops entries whose TTL elapsed, as a broker would.
    pub fn expire_now(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, deadline)| *deadline > now);
    }
}

#[async_trait]
impl WorkerRegistry for MemoryRegistry {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().1 > now)
            .map(|entry| (entry.key().clone(), entry.value().0.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RDB_KEY_TIMEOUT, REGISTER_INTERVAL};

    #[tokio::test]
    async fn announce_registers_worker_and_flows() {
        let registry = MemoryRegistry::new();
        let worker = Worker {
            id: "w1".into(),
            flows: vec!["serial".into()],
            concurrency: 2,
        };
        let descriptors = vec![("serial".to_string(), "{\"name\":\"serial\"}".to_string())];

        announce(&registry, &worker, true, &descriptors, RDB_KEY_TIMEOUT)
            .await
            .unwrap();

        let view = RegistryView::new(&registry);
        let workers = view.live_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "w1");
        let flows = view.live_flows().await.unwrap();
        assert_eq!(flows, descriptors);
    }

    #[tokio::test]
    async fn leaving_worker_mode_keeps_flow_descriptors() {
        let registry = MemoryRegistry::new();
        let worker = Worker {
            id: "w1".into(),
            flows: vec!["serial".into()],
            concurrency: 2,
        };
        let descriptors = vec![("serial".to_string(), "{}".to_string())];

        announce(&registry, &worker, true, &descriptors, RDB_KEY_TIMEOUT)
            .await
            .unwrap();
        announce(&registry, &worker, false, &descriptors, RDB_KEY_TIMEOUT)
            .await
            .unwrap();

        let view = RegistryView::new(&registry);
        assert!(view.live_workers().await.unwrap().is_empty());
        assert_eq!(view.live_flows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_disappear_from_scans() {
        let registry = MemoryRegistry::new();
        registry
            .set_with_ttl("goflow-worker:w1", "{}", Duration::from_nanos(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        registry.expire_now();
        assert!(registry.scan_prefix("goflow-worker").await.unwrap().is_empty());
    }

    #[test]
    fn heartbeat_fits_inside_the_ttl() {
        assert!(RDB_KEY_TIMEOUT > 2 * REGISTER_INTERVAL);
    }
}
