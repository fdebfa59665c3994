//! Metadata records and the persistence trait.
//!
//! A [`MetadataStore`] persists bucket and object records so the registry
//! can be rebuilt at startup.  Reads during normal operation never touch
//! the store; they go through the in-memory key index instead
//! (see [`super::index`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Content type applied when a PUT does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata record for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRecord {
    /// Bucket name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Metadata record for one stored object version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Bucket the object belongs to.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Body size in bytes.
    pub size: u64,
    /// Quoted ETag.
    pub etag: String,
    /// MIME content type.
    pub content_type: String,
    /// `x-amz-meta-*` pairs, with the prefix stripped.
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
    /// When this version was committed.
    pub last_modified: DateTime<Utc>,
    /// Name of the blob holding the body.
    pub blob: String,
}

impl ObjectRecord {
    /// Whether `self` supersedes `other` for the same key. Used to settle
    /// duplicate records left behind by a crash mid-replace.
    pub fn is_newer_than(&self, other: &ObjectRecord) -> bool {
        (self.last_modified, &self.blob) > (other.last_modified, &other.blob)
    }
}

/// Persistence contract for bucket and object records.
///
/// Object records are addressed by their blob, not their key: two records
/// for the same key can briefly coexist while one version replaces another.
pub trait MetadataStore: Send + Sync + 'static {
    /// Persist a bucket record.
    fn put_bucket(
        &self,
        record: &BucketRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Remove a bucket record and every object record in it.
    fn delete_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Every persisted bucket record.
    fn load_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BucketRecord>>> + Send + '_>>;

    /// Persist an object record. Once this returns, the version it
    /// describes survives a restart.
    fn put_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Remove an object record. Idempotent.
    fn delete_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Every persisted object record in `bucket`, in no particular order.
    fn load_objects(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(blob: &str, at: DateTime<Utc>) -> ObjectRecord {
        ObjectRecord {
            bucket: "b".into(),
            key: "k".into(),
            size: 1,
            etag: "\"x\"".into(),
            content_type: DEFAULT_CONTENT_TYPE.into(),
            user_metadata: BTreeMap::new(),
            last_modified: at,
            blob: blob.into(),
        }
    }

    #[test]
    fn test_is_newer_than() {
        let now = Utc::now();
        let old = record("aaaa", now);
        let new = record("0000", now + Duration::milliseconds(1));
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));

        // Same instant: the blob name breaks the tie deterministically.
        let tie = record("bbbb", now);
        assert!(tie.is_newer_than(&old));
    }

    #[test]
    fn test_object_record_json_shape() {
        let mut rec = record("0123", Utc::now());
        rec.user_metadata.insert("author".into(), "me".into());
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"user_metadata\":{\"author\":\"me\"}"));
        let back: ObjectRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
