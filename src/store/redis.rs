//! Redis-backed state and data stores.
//!
//! `update` runs as a Lua script so the compare-and-set stays atomic on
//! a shared multiplexed connection; counters map to `INCRBY` and
//! cleanup walks the namespace with `SCAN`.

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::RedisConfig;
use crate::errors::{EngineError, Result};

use super::{data_namespace, state_namespace, DataStore, StateStore};

/// Returns -1 when the key is absent, 0 on value mismatch, 1 on success.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

pub struct RedisStateStore {
    key_path: String,
    conn: ConnectionManager,
    cas: redis::Script,
}

impl RedisStateStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let mut conn = config.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            key_path: String::new(),
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{key}", self.key_path)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn configure(&mut self, flow_name: &str, request_id: &str) {
        self.key_path = state_namespace(flow_name, request_id);
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.full_key(key), value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(&full).await?;
        value.ok_or(EngineError::StoreNotFound { key: full })
    }

    async fn update(&self, key: &str, old: &str, new: &str) -> Result<()> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .cas
            .key(&full)
            .arg(old)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            1 => Ok(()),
            0 => Err(EngineError::StoreMismatch { key: full }),
            _ => Err(EngineError::StoreNotFound { key: full }),
        }
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(self.full_key(key), delta).await?;
        Ok(value)
    }

    async fn cleanup(&self) -> Result<()> {
        delete_matching(self.conn.clone(), format!("{}.*", self.key_path)).await
    }

    fn copy_store(&self) -> Box<dyn StateStore> {
        Box::new(Self {
            key_path: self.key_path.clone(),
            conn: self.conn.clone(),
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }
}

pub struct RedisDataStore {
    bucket: String,
    conn: ConnectionManager,
}

impl RedisDataStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let mut conn = config.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            bucket: String::new(),
            conn,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}.{key}.value", self.bucket)
    }
}

#[async_trait]
impl DataStore for RedisDataStore {
    fn configure(&mut self, flow_name: &str, request_id: &str) {
        self.bucket = data_namespace(flow_name, request_id);
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.full_key(key), value.as_ref()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(&full).await?;
        value
            .map(Bytes::from)
            .ok_or(EngineError::StoreNotFound { key: full })
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.full_key(key)).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        delete_matching(self.conn.clone(), format!("{}.*", self.bucket)).await
    }

    fn copy_store(&self) -> Box<dyn DataStore> {
        Box::new(Self {
            bucket: self.bucket.clone(),
            conn: self.conn.clone(),
        })
    }
}

async fn delete_matching(mut conn: ConnectionManager, pattern: String) -> Result<()> {
    let keys: Vec<String> = {
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys
    };
    if !keys.is_empty() {
        let _: () = conn.del(keys).await?;
    }
    Ok(())
}
