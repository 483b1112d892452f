//! Redis-backed cache store.
//!
//! Items live as JSON strings under `<prefix><key>`. Keys are enumerated with
//! `SCAN MATCH <prefix>*` so a sweep never blocks the server the way `KEYS`
//! would.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tagsweep_core::{BackendError, BackendResult, CacheBackend, CachedItem};

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 500;

pub struct RedisBackend {
    name: String,
    prefix: String,
    pool: Pool,
}

impl RedisBackend {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, pool: Pool) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            pool,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn conn(&self) -> BackendResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::connection(format!("failed to get Redis connection: {e}")))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| BackendError::internal(format!("SCAN failed: {e}")))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn get_item(&self, key: &str) -> BackendResult<Option<CachedItem>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| BackendError::internal(format!("GET {key} failed: {e}")))?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| BackendError::invalid_item(key, e.to_string())),
            None => Ok(None),
        }
    }

    async fn delete_item(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| BackendError::internal(format!("DEL {key} failed: {e}")))?;
        Ok(removed > 0)
    }
}
