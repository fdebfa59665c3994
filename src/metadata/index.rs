//! Versioned, copy-on-write key index.
//!
//! Each bucket keeps its live object records in a sorted [`KeyIndex`].
//! Readers take an `Arc` snapshot and work on it without holding any lock;
//! writers install a modified copy.  A snapshot therefore never changes
//! underneath a listing, no matter how many writes land meanwhile.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use super::store::ObjectRecord;

/// Sorted map from key to its current record.
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    entries: BTreeMap<String, Arc<ObjectRecord>>,
}

impl KeyIndex {
    pub fn get(&self, key: &str) -> Option<&Arc<ObjectRecord>> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `record`, returning the record it replaced.
    pub fn insert(&mut self, record: Arc<ObjectRecord>) -> Option<Arc<ObjectRecord>> {
        self.entries.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<ObjectRecord>> {
        self.entries.remove(key)
    }

    /// Records in key order, starting at `start` (inclusive or exclusive).
    pub fn range_from<'a>(
        &'a self,
        start: Bound<&'a str>,
    ) -> impl Iterator<Item = (&'a String, &'a Arc<ObjectRecord>)> + 'a {
        self.entries
            .range::<str, (Bound<&str>, Bound<&str>)>((start, Bound::Unbounded))
    }
}

/// A [`KeyIndex`] published through an atomically swappable `Arc`.
#[derive(Debug, Default)]
pub struct VersionedIndex {
    current: RwLock<Arc<KeyIndex>>,
}

impl VersionedIndex {
    pub fn new(index: KeyIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// The index as of now. Later writes do not affect the returned value.
    pub fn snapshot(&self) -> Arc<KeyIndex> {
        self.current.read().clone()
    }

    /// Apply `f` to the index and publish the result.
    ///
    /// The map is cloned only if a snapshot of the current index is still
    /// held elsewhere.
    pub fn update<R>(&self, f: impl FnOnce(&mut KeyIndex) -> R) -> R {
        let mut current = self.current.write();
        f(Arc::make_mut(&mut current))
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(key: &str) -> Arc<ObjectRecord> {
        Arc::new(ObjectRecord {
            bucket: "b".into(),
            key: key.into(),
            size: 0,
            etag: "\"e\"".into(),
            content_type: "text/plain".into(),
            user_metadata: Default::default(),
            last_modified: Utc::now(),
            blob: "0".repeat(32),
        })
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let index = VersionedIndex::default();
        index.update(|idx| idx.insert(record("a")));
        let before = index.snapshot();

        index.update(|idx| idx.insert(record("b")));
        index.update(|idx| idx.remove("a"));

        assert_eq!(before.len(), 1);
        assert!(before.get("a").is_some());
        let after = index.snapshot();
        assert!(after.get("a").is_none());
        assert!(after.get("b").is_some());
    }

    #[test]
    fn test_insert_returns_replaced() {
        let index = VersionedIndex::default();
        assert!(index.update(|idx| idx.insert(record("k"))).is_none());
        let replaced = index.update(|idx| idx.insert(record("k")));
        assert_eq!(replaced.map(|r| r.key.clone()), Some("k".to_string()));
        assert!(!index.is_empty());
    }

    #[test]
    fn test_range_from() {
        let mut idx = KeyIndex::default();
        for key in ["a", "b", "c"] {
            idx.insert(record(key));
        }
        let keys: Vec<&str> = idx
            .range_from(Bound::Excluded("a"))
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
        let keys: Vec<&str> = idx
            .range_from(Bound::Included("b"))
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
