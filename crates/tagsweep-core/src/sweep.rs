//! Sweep executor: evicts every cached item whose tags intersect the pending set.
//!
//! A sweep walks the registered backends in order. For each backend it either
//! asks the backend's tag index for candidate keys or, when the backend has no
//! index, enumerates every key. Each candidate is read and deleted only if its
//! `cacheTags` intersect the pending tags.
//!
//! Failures are contained per key and per backend: they are logged and counted
//! in the [`SweepReport`] but never abort the sweep or reach the caller that
//! requested the invalidation.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{CacheBackend, DynBackend};
use crate::tags::TagSet;

/// What started a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepTrigger {
    /// The debounce window elapsed.
    Timer,
    /// An explicit flush (e.g. on shutdown).
    Flush,
}

impl std::fmt::Display for SweepTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Flush => write!(f, "flush"),
        }
    }
}

/// Per-backend outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSweepStats {
    pub backend: String,
    /// Whether candidates came from the backend's tag index.
    pub indexed: bool,
    /// Keys inspected.
    pub scanned: usize,
    /// Items whose tags intersected the pending set.
    pub matched: usize,
    /// Items actually removed.
    pub evicted: usize,
    /// List, read and delete failures.
    pub errors: usize,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Debounce window this sweep drained.
    pub window: u64,
    pub trigger: SweepTrigger,
    pub tags: Vec<String>,
    pub backends: Vec<BackendSweepStats>,
    #[serde(rename = "durationMs", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.backends.iter().map(|b| b.evicted).sum()
    }

    pub fn errors(&self) -> usize {
        self.backends.iter().map(|b| b.errors).sum()
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Run one sweep of `tags` over `backends`.
///
/// Never fails: every backend error is absorbed into the report.
pub async fn execute(
    window: u64,
    trigger: SweepTrigger,
    tags: TagSet,
    backends: &[DynBackend],
) -> SweepReport {
    let started = Instant::now();
    let mut stats = Vec::with_capacity(backends.len());

    for backend in backends {
        stats.push(sweep_backend(backend.as_ref(), &tags).await);
    }

    let report = SweepReport {
        window,
        trigger,
        tags: tags.to_vec(),
        backends: stats,
        duration: started.elapsed(),
    };

    info!(
        window = report.window,
        trigger = %report.trigger,
        tags = report.tags.len(),
        evicted = report.evicted(),
        errors = report.errors(),
        elapsed_ms = report.duration.as_millis() as u64,
        "cache tag sweep completed"
    );

    report
}

/// Sweep a single backend. Errors are counted, not returned.
pub async fn sweep_backend(backend: &dyn CacheBackend, tags: &TagSet) -> BackendSweepStats {
    let name = backend.name();
    let mut stats = BackendSweepStats {
        backend: name.to_string(),
        ..Default::default()
    };

    let candidates = match backend.keys_tagged(tags).await {
        Ok(Some(keys)) => {
            stats.indexed = true;
            keys
        }
        Ok(None) => match backend.list_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(backend = %name, error = %e, "failed to enumerate cache keys; skipping backend");
                stats.errors += 1;
                return stats;
            }
        },
        Err(e) => {
            warn!(backend = %name, error = %e, "tag index lookup failed; falling back to key scan");
            stats.errors += 1;
            match backend.list_keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(backend = %name, error = %e, "failed to enumerate cache keys; skipping backend");
                    stats.errors += 1;
                    return stats;
                }
            }
        }
    };

    for key in candidates {
        stats.scanned += 1;

        let item = match backend.get_item(&key).await {
            Ok(Some(item)) => item,
            Ok(None) => continue,
            Err(e) => {
                warn!(backend = %name, key = %key, error = %e, "failed to read cache item");
                stats.errors += 1;
                continue;
            }
        };

        if !item.matches_any(tags) {
            continue;
        }
        stats.matched += 1;

        match backend.delete_item(&key).await {
            Ok(true) => {
                debug!(backend = %name, key = %key, "evicted tagged cache item");
                stats.evicted += 1;
            }
            Ok(false) => {
                debug!(backend = %name, key = %key, "tagged cache item already gone");
            }
            Err(e) => {
                warn!(backend = %name, key = %key, error = %e, "failed to delete cache item");
                stats.errors += 1;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, BackendResult};
    use crate::item::CachedItem;
    use crate::memory::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn tagged(tags: &[&str]) -> CachedItem {
        CachedItem::new(json!({})).with_tags(tags.iter().copied())
    }

    fn tags(list: &[&str]) -> TagSet {
        list.iter().copied().collect()
    }

    /// Full-scan backend whose reads and deletes fail for selected keys.
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_reads: Vec<&'static str>,
        fail_deletes: Vec<&'static str>,
        fail_listing: bool,
    }

    impl FlakyBackend {
        fn new(name: &str) -> Self {
            Self {
                inner: InMemoryBackend::new(name),
                fail_reads: Vec::new(),
                fail_deletes: Vec::new(),
                fail_listing: false,
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn list_keys(&self) -> BackendResult<Vec<String>> {
            if self.fail_listing {
                return Err(BackendError::connection("listing refused"));
            }
            let mut keys = self.inner.list_keys().await?;
            keys.sort();
            Ok(keys)
        }

        async fn get_item(&self, key: &str) -> BackendResult<Option<CachedItem>> {
            if self.fail_reads.iter().any(|k| *k == key) {
                return Err(BackendError::invalid_item(key, "corrupt"));
            }
            self.inner.get_item(key).await
        }

        async fn delete_item(&self, key: &str) -> BackendResult<bool> {
            if self.fail_deletes.iter().any(|k| *k == key) {
                return Err(BackendError::internal("delete refused"));
            }
            self.inner.delete_item(key).await
        }
    }

    #[tokio::test]
    async fn test_evicts_only_intersecting_items() {
        let backend = InMemoryBackend::new("pages");
        backend.set("k1", tagged(&["t1", "t2"]), None);
        backend.set("k2", tagged(&["t3"]), None);
        backend.set("plain", CachedItem::new(json!(1)), None);

        let stats = sweep_backend(&backend, &tags(&["t1"])).await;

        assert!(stats.indexed);
        assert_eq!(stats.evicted, 1);
        assert!(backend.get("k1").is_none());
        assert!(backend.get("k2").is_some());
        assert!(backend.get("plain").is_some());
    }

    #[tokio::test]
    async fn test_full_scan_without_index() {
        let backend = FlakyBackend::new("scan");
        backend.inner.set("a", tagged(&["x"]), None);
        backend.inner.set("b", tagged(&["y"]), None);

        let stats = sweep_backend(&backend, &tags(&["x", "y"])).await;

        assert!(!stats.indexed);
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.evicted, 2);
        assert!(backend.inner.is_empty());
    }

    #[tokio::test]
    async fn test_key_failures_do_not_abort_backend() {
        let mut backend = FlakyBackend::new("flaky");
        backend.fail_reads = vec!["a"];
        backend.fail_deletes = vec!["b"];
        for key in ["a", "b", "c"] {
            backend.inner.set(key, tagged(&["t"]), None);
        }

        let stats = sweep_backend(&backend, &tags(&["t"])).await;

        assert_eq!(stats.errors, 2);
        assert_eq!(stats.evicted, 1);
        assert!(backend.inner.get("c").is_none());
        assert!(backend.inner.get("a").is_some());
        assert!(backend.inner.get("b").is_some());
    }

    #[tokio::test]
    async fn test_backend_failure_is_isolated() {
        let mut broken = FlakyBackend::new("broken");
        broken.fail_listing = true;
        broken.inner.set("k", tagged(&["t"]), None);
        let healthy = InMemoryBackend::new("healthy");
        healthy.set("k", tagged(&["t"]), None);

        let broken = Arc::new(broken);
        let healthy = Arc::new(healthy);
        let backends: Vec<DynBackend> = vec![broken.clone() as DynBackend, healthy.clone() as DynBackend];

        let report = execute(1, SweepTrigger::Timer, tags(&["t"]), &backends).await;

        assert_eq!(report.backends[0].errors, 1);
        assert_eq!(report.backends[1].evicted, 1);
        assert!(healthy.is_empty());
        assert_eq!(broken.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_second_sweep_evicts_nothing() {
        let backend = Arc::new(InMemoryBackend::new("pages"));
        backend.set("k1", tagged(&["t1"]), None);
        backend.set("k2", tagged(&["t2"]), None);
        let backends: Vec<DynBackend> = vec![backend.clone() as DynBackend];

        let first = execute(1, SweepTrigger::Timer, tags(&["t1"]), &backends).await;
        let second = execute(2, SweepTrigger::Timer, tags(&["t1"]), &backends).await;

        assert_eq!(first.evicted(), 1);
        assert_eq!(second.evicted(), 0);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_report_serializes_duration_in_millis() {
        let report = SweepReport {
            window: 3,
            trigger: SweepTrigger::Flush,
            tags: vec!["t".into()],
            backends: vec![],
            duration: Duration::from_millis(42),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["durationMs"], 42);
        assert_eq!(value["trigger"], "flush");
    }
}
