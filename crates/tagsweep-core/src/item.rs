//! Cached items as seen by the invalidation engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tags::TagSet;

/// A cached artifact.
///
/// The payload is opaque to the engine; only `cacheTags` is inspected during
/// a sweep. Serialised as `{"value": ..., "cacheTags": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedItem {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_tags: Option<Vec<String>>,
}

impl CachedItem {
    /// Create an untagged item.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            cache_tags: None,
        }
    }

    /// Attach tags to this item.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn cache_tags(&self) -> Option<&[String]> {
        self.cache_tags.as_deref()
    }

    /// Whether any of this item's tags is pending invalidation.
    ///
    /// Untagged items never match.
    pub fn matches_any(&self, pending: &TagSet) -> bool {
        self.cache_tags()
            .is_some_and(|tags| pending.intersects(tags))
    }
}
