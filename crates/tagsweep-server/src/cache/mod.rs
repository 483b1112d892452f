//! Cache backends owned by the server.
//!
//! ## Backend kinds
//!
//! - **memory**: in-process `InMemoryBackend`, swept through its tag index
//! - **redis**: keys under a prefix in a shared Redis, swept with SCAN
//!
//! ## Graceful Degradation
//!
//! If Redis is unreachable at startup, redis backends are left out of the
//! registry and the cross-instance listener is not started. Memory backends
//! keep working.

pub mod pubsub;
pub mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use tagsweep_core::{BackendRegistry, DynBackend, InMemoryBackend};

use crate::config::{AppConfig, BackendKind, RedisConfig};

pub use pubsub::{PurgeMessage, TagPublisher, TagPurgeListener};
pub use redis_store::RedisBackend;

/// Create and verify a Redis pool.
///
/// Returns `None` when Redis is disabled or cannot be reached.
pub async fn create_redis_pool(config: &RedisConfig) -> Option<Pool> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-process backends only");
        return None;
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool. Redis backends disabled.");
            return None;
        }
    };

    // Test connection
    match pool.get().await {
        Ok(_) => {
            tracing::info!("Connected to Redis successfully");
            Some(pool)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to connect to Redis. Redis backends disabled.");
            None
        }
    }
}

/// Backends built from `cache.backends`.
///
/// The registry holds every backend as a trait object for sweeping; memory
/// backends are also kept typed so the embedding application can write to
/// them.
pub struct CacheBackends {
    pub registry: Arc<BackendRegistry>,
    pub memory: HashMap<String, Arc<InMemoryBackend>>,
}

impl CacheBackends {
    pub fn memory_backend(&self, name: &str) -> Option<Arc<InMemoryBackend>> {
        self.memory.get(name).cloned()
    }
}

/// Build every configured backend, registered in declaration order.
pub fn build_backends(config: &AppConfig, pool: Option<&Pool>) -> CacheBackends {
    let registry = BackendRegistry::new();
    let mut memory = HashMap::new();

    for backend in &config.cache.backends {
        let instance: DynBackend = match (backend.kind, pool) {
            (BackendKind::Memory, _) => {
                let store = Arc::new(InMemoryBackend::new(backend.name.clone()));
                memory.insert(backend.name.clone(), Arc::clone(&store));
                store
            }
            (BackendKind::Redis, Some(pool)) => {
                let prefix = backend
                    .prefix
                    .clone()
                    .unwrap_or_else(|| format!("{}:", backend.name));
                Arc::new(RedisBackend::new(backend.name.clone(), prefix, pool.clone()))
            }
            (BackendKind::Redis, None) => {
                tracing::warn!(backend = %backend.name, "Redis unavailable; skipping backend");
                continue;
            }
        };

        tracing::info!(backend = %backend.name, kind = %backend.kind, "registered cache backend");
        registry.register(instance);
    }

    CacheBackends {
        registry: Arc::new(registry),
        memory,
    }
}
