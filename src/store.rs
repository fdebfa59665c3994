//! Object operations over the registry, blob storage and metadata.
//!
//! Every write follows the same path: register with the bucket, stream the
//! body into staging, then commit under the key's write lock (blob rename,
//! sidecar record, index install), and finally drop whatever version was
//! replaced.  Reads hold the key's shared lock only long enough to take a
//! record snapshot and open its blob, so streaming a large body never
//! blocks a writer.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::S3Error;
use crate::listing::{self, ListQuery, ListingPage};
use crate::metadata::store::{MetadataStore, ObjectRecord, DEFAULT_CONTENT_TYPE};
use crate::registry::{BucketRegistry, WriteTicket};
use crate::storage::backend::{new_blob_name, BlobReader, ByteStream, StagedBlob, StorageBackend};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// A single `Range: bytes=` request, not yet resolved against a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// `bytes=start-end`
    StartEnd(u64, u64),
    /// `bytes=start-`
    StartOpen(u64),
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

impl RangeRequest {
    /// Resolve against an object of `total` bytes into an inclusive
    /// `(start, end)`, or `None` if unsatisfiable.
    pub fn resolve(&self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        match *self {
            RangeRequest::StartEnd(start, end) => {
                (start < total && start <= end).then(|| (start, end.min(total - 1)))
            }
            RangeRequest::StartOpen(start) => (start < total).then_some((start, total - 1)),
            RangeRequest::Suffix(0) => None,
            RangeRequest::Suffix(n) => Some((total.saturating_sub(n), total - 1)),
        }
    }
}

/// Attributes supplied with a PUT or multipart initiation.
#[derive(Debug, Clone, Default)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
}

/// An opened object: the record snapshot plus its body.
pub struct ObjectBody {
    pub record: Arc<ObjectRecord>,
    /// Inclusive byte range served, when a range was requested.
    pub range: Option<(u64, u64)>,
    pub reader: BlobReader,
}

/// Per-key outcome of a bulk delete.
pub type DeleteOutcome = (String, Result<(), S3Error>);

pub fn validate_key(key: &str) -> Result<(), S3Error> {
    if key.is_empty() {
        return Err(S3Error::InvalidArgument {
            message: "Object key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(S3Error::KeyTooLong);
    }
    Ok(())
}

/// Put/Get/Head/Delete/List over live buckets.
pub struct ObjectStore {
    registry: Arc<BucketRegistry>,
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
}

impl ObjectStore {
    pub fn new(
        registry: Arc<BucketRegistry>,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            registry,
            storage,
            metadata,
        }
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    /// Store `body` under `key`, atomically replacing any previous object.
    ///
    /// If the body stream fails, nothing becomes visible and the previous
    /// object (if any) is untouched.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        attrs: ObjectAttributes,
    ) -> Result<Arc<ObjectRecord>, S3Error> {
        validate_key(key)?;
        let ticket = self.registry.get(bucket)?.begin_write().await?;
        let staged = self
            .storage
            .stage(body)
            .await
            .map_err(S3Error::from_transfer)?;
        self.commit_staged(&ticket, key, staged, attrs).await
    }

    /// Publish a staged body as the current version of `key`.
    ///
    /// Consumes the staged body on every path: it is either committed or
    /// discarded.
    pub(crate) async fn commit_staged(
        &self,
        ticket: &WriteTicket,
        key: &str,
        staged: StagedBlob,
        attrs: ObjectAttributes,
    ) -> Result<Arc<ObjectRecord>, S3Error> {
        let bucket = ticket.bucket();
        let blob = new_blob_name();

        let lock = bucket.locks.lock_for(key);
        let guard = lock.write().await;

        let record = Arc::new(ObjectRecord {
            bucket: bucket.name().to_string(),
            key: key.to_string(),
            size: staged.size,
            etag: staged.etag.clone(),
            content_type: attrs
                .content_type
                .filter(|ct| !ct.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            user_metadata: attrs.user_metadata,
            last_modified: Utc::now(),
            blob: blob.clone(),
        });

        if let Err(err) = self.storage.commit(&staged, bucket.name(), &blob).await {
            drop(guard);
            if let Err(cleanup) = self.storage.discard(&staged).await {
                warn!("failed to discard staged body {}: {cleanup}", staged.id);
            }
            return Err(err.into());
        }
        if let Err(err) = self.metadata.put_object(&record).await {
            drop(guard);
            if let Err(cleanup) = self.storage.delete(bucket.name(), &blob).await {
                warn!(bucket = %bucket.name(), blob = %blob, "failed to remove uncommitted blob: {cleanup}");
            }
            return Err(err.into());
        }
        let previous = bucket.index.update(|idx| idx.insert(Arc::clone(&record)));
        drop(guard);

        if let Some(previous) = previous {
            self.discard_version(&previous).await;
        }
        debug!(bucket = %record.bucket, key = %key, size = record.size, "object committed");
        Ok(record)
    }

    /// Remove a replaced or deleted version's record and blob. Failures
    /// only leave garbage that the next startup sweeps.
    async fn discard_version(&self, record: &ObjectRecord) {
        if let Err(err) = self.metadata.delete_object(record).await {
            warn!(bucket = %record.bucket, key = %record.key, "failed to remove old record: {err}");
        }
        if let Err(err) = self.storage.delete(&record.bucket, &record.blob).await {
            warn!(bucket = %record.bucket, blob = %record.blob, "failed to remove old blob: {err}");
        }
    }

    /// Open `key` for reading. The body reflects the object as of the
    /// moment the read began.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<RangeRequest>,
    ) -> Result<ObjectBody, S3Error> {
        let bucket = self.registry.get(bucket)?;
        let lock = bucket.locks.lock_for(key);
        let _guard = lock.read().await;

        let record = bucket
            .index
            .snapshot()
            .get(key)
            .cloned()
            .ok_or_else(|| S3Error::NoSuchKey {
                key: key.to_string(),
            })?;
        let resolved = match range {
            Some(range) => Some(range.resolve(record.size).ok_or(S3Error::InvalidRange)?),
            None => None,
        };
        let reader = self
            .storage
            .open(bucket.name(), &record.blob, resolved)
            .await?;
        Ok(ObjectBody {
            record,
            range: resolved,
            reader,
        })
    }

    /// Metadata of `key` without its body.
    pub fn head_object(&self, bucket: &str, key: &str) -> Result<Arc<ObjectRecord>, S3Error> {
        let bucket = self.registry.get(bucket)?;
        let snapshot = bucket.index.snapshot();
        snapshot.get(key).cloned().ok_or_else(|| S3Error::NoSuchKey {
            key: key.to_string(),
        })
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), S3Error> {
        let ticket = self.registry.get(bucket)?.begin_write().await?;
        self.delete_registered(&ticket, key).await
    }

    async fn delete_registered(&self, ticket: &WriteTicket, key: &str) -> Result<(), S3Error> {
        let bucket = ticket.bucket();
        let lock = bucket.locks.lock_for(key);
        let guard = lock.write().await;

        let Some(record) = bucket.index.snapshot().get(key).cloned() else {
            return Ok(());
        };
        // The record is the commit point: once it is gone the object is
        // gone, even across a restart.
        self.metadata.delete_object(&record).await?;
        bucket.index.update(|idx| idx.remove(key));
        drop(guard);

        if let Err(err) = self.storage.delete(bucket.name(), &record.blob).await {
            warn!(bucket = %bucket.name(), blob = %record.blob, "failed to remove deleted blob: {err}");
        }
        debug!(bucket = %bucket.name(), key = %key, "object deleted");
        Ok(())
    }

    /// Delete several keys, each atomically, reporting per key.
    pub async fn delete_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> Result<Vec<DeleteOutcome>, S3Error> {
        let ticket = self.registry.get(bucket)?.begin_write().await?;
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            let result = match validate_key(&key) {
                Ok(()) => self.delete_registered(&ticket, &key).await,
                Err(err) => Err(err),
            };
            outcomes.push((key, result));
        }
        Ok(outcomes)
    }

    /// One page of a listing, computed over a snapshot of the bucket.
    pub fn list_objects(&self, bucket: &str, query: &ListQuery) -> Result<ListingPage, S3Error> {
        let bucket = self.registry.get(bucket)?;
        let snapshot = bucket.index.snapshot();
        Ok(listing::list(&snapshot, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::sidecar::SidecarMetadataStore;
    use crate::storage::backend::{collect_stream, stream_from_bytes};
    use crate::storage::local::LocalBackend;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;

    fn memory_store() -> ObjectStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let registry = Arc::new(BucketRegistry::new(storage.clone(), metadata.clone()));
        ObjectStore::new(registry, storage, metadata)
    }

    fn local_store(root: &std::path::Path) -> ObjectStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(root).unwrap());
        let metadata: Arc<dyn MetadataStore> = Arc::new(SidecarMetadataStore::new(root).unwrap());
        let registry = Arc::new(BucketRegistry::new(storage.clone(), metadata.clone()));
        ObjectStore::new(registry, storage, metadata)
    }

    async fn read_all(store: &ObjectStore, bucket: &str, key: &str) -> Bytes {
        let body = store.get_object(bucket, key, None).await.unwrap();
        collect_stream(body.reader.stream).await.unwrap()
    }

    #[test]
    fn test_range_resolve() {
        assert_eq!(RangeRequest::StartEnd(0, 4).resolve(10), Some((0, 4)));
        assert_eq!(RangeRequest::StartEnd(5, 100).resolve(10), Some((5, 9)));
        assert_eq!(RangeRequest::StartEnd(10, 12).resolve(10), None);
        assert_eq!(RangeRequest::StartOpen(3).resolve(10), Some((3, 9)));
        assert_eq!(RangeRequest::Suffix(4).resolve(10), Some((6, 9)));
        assert_eq!(RangeRequest::Suffix(40).resolve(10), Some((0, 9)));
        assert_eq!(RangeRequest::Suffix(0).resolve(10), None);
        assert_eq!(RangeRequest::StartOpen(0).resolve(0), None);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());
        assert!(matches!(
            validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)),
            Err(S3Error::KeyTooLong)
        ));
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = memory_store();
        store.registry().create_bucket("example-bucket").await.unwrap();

        let record = store
            .put_object(
                "example-bucket",
                "hello.txt",
                stream_from_bytes("Hello from Python!"),
                ObjectAttributes::default(),
            )
            .await
            .unwrap();
        assert_eq!(record.size, 18);
        assert_eq!(record.content_type, DEFAULT_CONTENT_TYPE);

        let first = store
            .get_object("example-bucket", "hello.txt", None)
            .await
            .unwrap();
        assert_eq!(first.record.etag, record.etag);
        assert_eq!(
            collect_stream(first.reader.stream).await.unwrap(),
            "Hello from Python!"
        );
        assert_eq!(
            read_all(&store, "example-bucket", "hello.txt").await,
            "Hello from Python!"
        );
    }

    #[tokio::test]
    async fn test_missing_bucket_and_key() {
        let store = memory_store();
        let err = store
            .put_object("nope", "k", stream_from_bytes("x"), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::NoSuchBucket { .. }));

        store.registry().create_bucket("bucket").await.unwrap();
        let err = store.get_object("bucket", "absent", None).await.err().unwrap();
        assert!(matches!(err, S3Error::NoSuchKey { .. }));
        assert!(matches!(
            store.head_object("bucket", "absent"),
            Err(S3Error::NoSuchKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let store = memory_store();
        store.registry().create_bucket("bucket").await.unwrap();
        store.delete_object("bucket", "ghost").await.unwrap();

        store
            .put_object("bucket", "k", stream_from_bytes("v"), Default::default())
            .await
            .unwrap();
        store.delete_object("bucket", "k").await.unwrap();
        let err = store.get_object("bucket", "k", None).await.err().unwrap();
        assert!(matches!(err, S3Error::NoSuchKey { .. }));
    }

    #[tokio::test]
    async fn test_replace_removes_old_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        store.registry().create_bucket("bucket").await.unwrap();

        let first = store
            .put_object("bucket", "k", stream_from_bytes("one"), Default::default())
            .await
            .unwrap();
        let second = store
            .put_object("bucket", "k", stream_from_bytes("two!"), Default::default())
            .await
            .unwrap();

        assert_ne!(first.blob, second.blob);
        assert!(!tmp.path().join("bucket").join(&first.blob).exists());
        assert!(!tmp
            .path()
            .join("bucket")
            .join(format!("{}.json", first.blob))
            .exists());
        assert_eq!(read_all(&store, "bucket", "k").await, "two!");
    }

    #[tokio::test]
    async fn test_failed_stream_keeps_previous_object() {
        let store = memory_store();
        store.registry().create_bucket("bucket").await.unwrap();
        store
            .put_object("bucket", "k", stream_from_bytes("original"), Default::default())
            .await
            .unwrap();

        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "cut")),
        ]));
        let err = store
            .put_object("bucket", "k", failing, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::IncompleteBody));
        assert_eq!(read_all(&store, "bucket", "k").await, "original");

        // The failed write no longer counts against the bucket.
        let bucket = store.registry().get("bucket").unwrap();
        assert_eq!(bucket.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reader_keeps_snapshot_across_replace() {
        let tmp = tempfile::tempdir().unwrap();
        let store = local_store(tmp.path());
        store.registry().create_bucket("bucket").await.unwrap();
        store
            .put_object("bucket", "k", stream_from_bytes("before"), Default::default())
            .await
            .unwrap();

        let body = store.get_object("bucket", "k", None).await.unwrap();
        store
            .put_object("bucket", "k", stream_from_bytes("after"), Default::default())
            .await
            .unwrap();
        assert_eq!(collect_stream(body.reader.stream).await.unwrap(), "before");
        assert_eq!(read_all(&store, "bucket", "k").await, "after");
    }

    #[tokio::test]
    async fn test_concurrent_puts_never_mix() {
        let store = Arc::new(memory_store());
        store.registry().create_bucket("bucket").await.unwrap();
        let a = Bytes::from(vec![b'A'; 64 * 1024]);
        let b = Bytes::from(vec![b'B'; 64 * 1024]);

        for _ in 0..10 {
            let mut handles = Vec::new();
            for body in [a.clone(), b.clone()] {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store
                        .put_object("bucket", "shared", stream_from_bytes(body), Default::default())
                        .await
                        .unwrap()
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let body = store.get_object("bucket", "shared", None).await.unwrap();
            let etag = body.record.etag.clone();
            let data = collect_stream(body.reader.stream).await.unwrap();
            assert!(data == a || data == b);
            let expected = crate::storage::backend::quote_etag(&{
                use md5::Digest;
                md5::Md5::digest(&data)
            });
            assert_eq!(etag, expected);
        }
    }

    #[tokio::test]
    async fn test_get_range() {
        let store = memory_store();
        store.registry().create_bucket("bucket").await.unwrap();
        store
            .put_object("bucket", "k", stream_from_bytes("0123456789"), Default::default())
            .await
            .unwrap();

        let body = store
            .get_object("bucket", "k", Some(RangeRequest::Suffix(3)))
            .await
            .unwrap();
        assert_eq!(body.range, Some((7, 9)));
        assert_eq!(collect_stream(body.reader.stream).await.unwrap(), "789");

        let err = store
            .get_object("bucket", "k", Some(RangeRequest::StartOpen(10)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, S3Error::InvalidRange));
    }

    #[tokio::test]
    async fn test_delete_objects_reports_per_key() {
        let store = memory_store();
        store.registry().create_bucket("bucket").await.unwrap();
        for key in ["a", "b"] {
            store
                .put_object("bucket", key, stream_from_bytes("x"), Default::default())
                .await
                .unwrap();
        }
        let outcomes = store
            .delete_objects(
                "bucket",
                vec!["a".into(), "missing".into(), "k".repeat(MAX_KEY_LENGTH + 1)],
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_ok());
        assert!(matches!(outcomes[2].1, Err(S3Error::KeyTooLong)));
        assert!(store.head_object("bucket", "a").is_err());
        assert!(store.head_object("bucket", "b").is_ok());
    }

    #[tokio::test]
    async fn test_delete_bucket_after_objects_removed() {
        let store = memory_store();
        store.registry().create_bucket("bucket").await.unwrap();
        store
            .put_object("bucket", "k", stream_from_bytes("x"), Default::default())
            .await
            .unwrap();
        let err = store.registry().delete_bucket("bucket").await.unwrap_err();
        assert!(matches!(err, S3Error::NotEmpty { .. }));

        store.delete_object("bucket", "k").await.unwrap();
        store.registry().delete_bucket("bucket").await.unwrap();
    }

    #[tokio::test]
    async fn test_user_metadata_and_content_type_persist() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = local_store(tmp.path());
            store.registry().create_bucket("bucket").await.unwrap();
            let mut attrs = ObjectAttributes {
                content_type: Some("application/json".into()),
                ..Default::default()
            };
            attrs.user_metadata.insert("owner".into(), "alice".into());
            store
                .put_object("bucket", "data.json", stream_from_bytes("{}"), attrs)
                .await
                .unwrap();
        }

        let store = local_store(tmp.path());
        store.registry().load().await.unwrap();
        let record = store.head_object("bucket", "data.json").unwrap();
        assert_eq!(record.content_type, "application/json");
        assert_eq!(record.user_metadata.get("owner").unwrap(), "alice");
        assert_eq!(read_all(&store, "bucket", "data.json").await, "{}");
    }
}
