//! Cache backend capability interface and the ordered backend registry.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BackendResult;
use crate::item::CachedItem;
use crate::tags::TagSet;

/// The minimal surface a cache store exposes to the invalidation engine.
///
/// Implementations must be thread-safe; a sweep may run while request
/// handlers are reading and writing the same store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Stable name used for logging, metrics and de-duplicated registration.
    fn name(&self) -> &str;

    /// Enumerate every key currently stored.
    ///
    /// Called once per sweep. The result is not cached across sweeps.
    async fn list_keys(&self) -> BackendResult<Vec<String>>;

    /// Read the item stored under `key`.
    ///
    /// Returns `None` if the key is absent or expired.
    async fn get_item(&self, key: &str) -> BackendResult<Option<CachedItem>>;

    /// Delete the item stored under `key`.
    ///
    /// Returns `true` if something was removed.
    async fn delete_item(&self, key: &str) -> BackendResult<bool>;

    /// Candidate keys carrying any of `tags`, if the backend keeps a tag index.
    ///
    /// `Ok(None)` means "no index, enumerate everything". Candidates are still
    /// read and checked before deletion, so a stale index only costs reads.
    async fn keys_tagged(&self, _tags: &TagSet) -> BackendResult<Option<Vec<String>>> {
        Ok(None)
    }
}

/// Type alias for a shared backend trait object.
pub type DynBackend = Arc<dyn CacheBackend>;

/// Ordered set of backends swept on every invalidation.
///
/// Backends are swept in registration order. Names are unique: registering a
/// second backend under an existing name is a no-op, so concurrent or repeated
/// start-up registration converges on a single instance.
pub struct BackendRegistry {
    backends: ArcSwap<Vec<DynBackend>>,
    write_lock: Mutex<()>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Build a registry from backends in order, skipping duplicate names.
    pub fn from_backends(backends: impl IntoIterator<Item = DynBackend>) -> Self {
        let registry = Self::new();
        for backend in backends {
            registry.register(backend);
        }
        registry
    }

    /// Register a backend. Returns `false` if the name was already taken.
    pub fn register(&self, backend: DynBackend) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.backends.load();
        if current.iter().any(|b| b.name() == backend.name()) {
            tracing::warn!(backend = %backend.name(), "cache backend already registered; ignoring");
            return false;
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        tracing::info!(backend = %backend.name(), "cache backend registered");
        next.push(backend);
        self.backends.store(Arc::new(next));
        true
    }

    /// Lock-free view of the backends registered right now.
    pub fn snapshot(&self) -> Arc<Vec<DynBackend>> {
        self.backends.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends
            .load()
            .iter()
            .map(|b| b.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.load().is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
