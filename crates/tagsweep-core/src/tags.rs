//! Deduplicated tag collections.

use indexmap::IndexSet;

/// An insertion-ordered set of distinct cache tags.
///
/// Used both as the scheduler's pending buffer and as the input handed to a
/// sweep. Duplicates are dropped on insertion, so draining never has to
/// deduplicate again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: IndexSet<String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single tag. Returns `true` if it was not already present.
    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        self.tags.insert(tag.into())
    }

    /// Insert every tag, returning how many were new.
    pub fn extend<I, S>(&mut self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter()
            .map(Into::into)
            .fold(0, |added, tag| added + usize::from(self.tags.insert(tag)))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns `true` if any of `tags` is in this set.
    pub fn intersects<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }

    /// Take every tag out, leaving this set empty.
    pub fn drain(&mut self) -> TagSet {
        std::mem::take(self)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = TagSet::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for TagSet {
    type Item = String;
    type IntoIter = indexmap::set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_deduplicates() {
        let mut set = TagSet::new();
        assert_eq!(set.extend(["a", "b", "a"]), 2);
        assert_eq!(set.extend(["b", "c"]), 1);
        assert_eq!(set.to_vec(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drain_leaves_empty() {
        let mut set: TagSet = ["x", "y"].into_iter().collect();
        let drained = set.drain();
        assert!(set.is_empty());
        assert_eq!(drained.len(), 2);
        assert!(drained.contains("x"));
    }

    #[test]
    fn test_intersects() {
        let set: TagSet = ["t1"].into_iter().collect();
        assert!(set.intersects(&["t2", "t1"]));
        assert!(!set.intersects(&["t3"]));
        assert!(!set.intersects::<&str>(&[]));
    }
}
