//! In-process cache backend with TTL support and a standing tag index.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::backend::CacheBackend;
use crate::error::BackendResult;
use crate::item::CachedItem;
use crate::tags::TagSet;

/// A stored item with its expiry metadata.
///
/// The item is wrapped in `Arc` so cache hits clone a pointer, not the payload.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub item: Arc<CachedItem>,
    pub cached_at: Instant,
    pub ttl: Option<Duration>,
}

impl CachedEntry {
    pub fn new(item: CachedItem, ttl: Option<Duration>) -> Self {
        Self {
            item: Arc::new(item),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.cached_at.elapsed() > ttl)
    }

    fn tags(&self) -> &[String] {
        self.item.cache_tags().unwrap_or_default()
    }
}

/// Backend statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub entries: usize,
    pub indexed_tags: usize,
}

/// `DashMap`-backed cache store.
///
/// Alongside the entries it maintains a tag → keys index, updated on every
/// write while the entry's shard lock is held, so `keys_tagged` lets a sweep
/// skip the full key scan.
pub struct InMemoryBackend {
    name: String,
    entries: DashMap<String, CachedEntry>,
    tag_index: DashMap<String, HashSet<String>>,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            tag_index: DashMap::new(),
        }
    }

    /// Store an item, replacing any previous value under `key`.
    ///
    /// `ttl = None` keeps the item until it is deleted.
    pub fn set(&self, key: impl Into<String>, item: CachedItem, ttl: Option<Duration>) {
        let key = key.into();
        let entry = CachedEntry::new(item, ttl);

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let stale: Vec<String> = occupied
                    .get()
                    .tags()
                    .iter()
                    .filter(|t| !entry.tags().contains(*t))
                    .cloned()
                    .collect();
                self.unindex(&key, &stale);
                self.index(&key, entry.tags());
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                self.index(&key, entry.tags());
                vacant.insert(entry);
            }
        }
        tracing::trace!(backend = %self.name, key = %key, "cache set");
    }

    /// Read an item, pruning it if it has expired.
    pub fn get(&self, key: &str) -> Option<Arc<CachedItem>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(Arc::clone(&entry.item)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove_expired(key);
        }
        None
    }

    /// Remove an item and its index entries. Returns `true` if it existed.
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.unindex(key, occupied.get().tags());
                occupied.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| e.key().clone())
            .collect();

        expired.iter().filter(|key| self.remove_expired(key)).count()
    }

    /// Run `cleanup_expired` every `period` until the task is aborted.
    pub fn start_cleanup_task(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let removed = self.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(backend = %self.name, removed, "expired cache entries reclaimed");
                }
            }
        })
    }

    // Re-checks expiry under the shard lock; a fresh `set` since the caller
    // looked must survive.
    fn remove_expired(&self, key: &str) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired() => {
                self.unindex(key, occupied.get().tags());
                occupied.remove();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.entries.len(),
            indexed_tags: self.tag_index.len(),
        }
    }

    fn index(&self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(mut keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                let now_empty = keys.is_empty();
                drop(keys);
                if now_empty {
                    self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
                }
            }
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_keys(&self) -> BackendResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.key().clone())
            .collect())
    }

    async fn get_item(&self, key: &str) -> BackendResult<Option<CachedItem>> {
        Ok(self.get(key).map(|item| (*item).clone()))
    }

    async fn delete_item(&self, key: &str) -> BackendResult<bool> {
        Ok(self.remove(key))
    }

    async fn keys_tagged(&self, tags: &TagSet) -> BackendResult<Option<Vec<String>>> {
        let mut keys = HashSet::new();
        for tag in tags.iter() {
            if let Some(tagged) = self.tag_index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        Ok(Some(keys.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(tags: &[&str]) -> CachedItem {
        CachedItem::new(json!("<html/>")).with_tags(tags.iter().copied())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new("pages");
        backend.set("k1", page(&["t1"]), None);

        let item = backend.get_item("k1").await.unwrap();
        assert_eq!(item.unwrap().cache_tags(), Some(&["t1".to_string()][..]));

        assert!(backend.delete_item("k1").await.unwrap());
        assert!(!backend.delete_item("k1").await.unwrap());
        assert!(backend.get_item("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tag_index_follows_writes() {
        let backend = InMemoryBackend::new("pages");
        backend.set("k1", page(&["t1", "t2"]), None);
        backend.set("k2", page(&["t2"]), None);

        let t2: TagSet = ["t2"].into_iter().collect();
        let mut keys = backend.keys_tagged(&t2).await.unwrap().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);

        // Retagging k1 drops it from t2.
        backend.set("k1", page(&["t1"]), None);
        let keys = backend.keys_tagged(&t2).await.unwrap().unwrap();
        assert_eq!(keys, vec!["k2"]);

        backend.remove("k2");
        assert!(backend.keys_tagged(&t2).await.unwrap().unwrap().is_empty());
        assert_eq!(backend.stats().indexed_tags, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent() {
        let backend = InMemoryBackend::new("pages");
        backend.set("short", page(&["t1"]), Some(Duration::from_millis(10)));
        backend.set("long", page(&["t1"]), None);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(backend.list_keys().await.unwrap(), vec!["long"]);
        assert!(backend.get_item("short").await.unwrap().is_none());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let backend = InMemoryBackend::new("pages");
        for i in 0..3 {
            backend.set(format!("k{i}"), page(&["t"]), Some(Duration::from_millis(5)));
        }
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(backend.cleanup_expired(), 3);
        assert!(backend.is_empty());
        assert_eq!(backend.stats(), MemoryStats::default());
    }

    #[test]
    fn test_cleanup_keeps_entries_rewritten_after_expiry() {
        let backend = InMemoryBackend::new("pages");
        backend.set("k1", page(&["old"]), Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(15));

        // Same key written again before anything pruned it
        backend.set("k1", page(&["new"]), None);

        assert_eq!(backend.cleanup_expired(), 0);
        // A reader that saw the expired value prunes only if it is still expired
        assert!(!backend.remove_expired("k1"));
        assert!(backend.get("k1").is_some());
        assert_eq!(backend.stats().indexed_tags, 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_reclaims_unread_entries() {
        let backend = Arc::new(InMemoryBackend::new("pages"));
        for i in 0..100 {
            let tag = format!("t{i}");
            backend.set(format!("k{i}"), page(&[tag.as_str()]), Some(Duration::from_millis(1)));
        }
        backend.set("keep", page(&["t0"]), None);

        let task = Arc::clone(&backend).start_cleanup_task(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(
            backend.stats(),
            MemoryStats {
                entries: 1,
                indexed_tags: 1,
            }
        );
    }
}
