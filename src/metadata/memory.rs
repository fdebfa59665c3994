//! In-memory metadata store.
//!
//! Holds records in memory with no persistence. Paired with the memory
//! storage backend for tests and ephemeral deployments.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::store::{BucketRecord, MetadataStore, ObjectRecord};

type BlobKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BucketRecord>,
    /// (bucket, blob) -> record.
    objects: HashMap<BlobKey, ObjectRecord>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put_bucket(
        &self,
        record: &BucketRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            self.inner
                .write()
                .buckets
                .insert(record.name.clone(), record);
            Ok(())
        })
    }

    fn delete_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write();
            inner.buckets.remove(&name);
            inner.objects.retain(|(bucket, _), _| *bucket != name);
            Ok(())
        })
    }

    fn load_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BucketRecord>>> + Send + '_>> {
        Box::pin(async move { Ok(self.inner.read().buckets.values().cloned().collect()) })
    }

    fn put_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            let mut inner = self.inner.write();
            if !inner.buckets.contains_key(&record.bucket) {
                anyhow::bail!("bucket {} has no record", record.bucket);
            }
            inner
                .objects
                .insert((record.bucket.clone(), record.blob.clone()), record);
            Ok(())
        })
    }

    fn delete_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = (record.bucket.clone(), record.blob.clone());
        Box::pin(async move {
            self.inner.write().objects.remove(&key);
            Ok(())
        })
    }

    fn load_objects(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            Ok(self
                .inner
                .read()
                .objects
                .values()
                .filter(|r| r.bucket == bucket)
                .cloned()
                .collect())
        })
    }
}
