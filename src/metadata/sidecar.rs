//! Sidecar JSON metadata store.
//!
//! Each bucket directory carries a `.bucket.json` record, and each blob
//! `<blob>` carries its object record in `<blob>.json` right next to it.
//! Records are written to a temp file in the same directory and renamed
//! into place, so a reader (or a restart) only ever sees a complete record.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use super::store::{BucketRecord, MetadataStore, ObjectRecord};
use crate::storage::backend::is_blob_name;

/// File name of the per-bucket record.
pub const BUCKET_RECORD: &str = ".bucket.json";

/// Metadata store persisting records as JSON files beside the data.
pub struct SidecarMetadataStore {
    root: PathBuf,
}

impl SidecarMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> anyhow::Result<PathBuf> {
        if bucket.is_empty() || bucket.starts_with('.') || bucket.contains('/') {
            anyhow::bail!("invalid bucket directory name: {bucket}");
        }
        Ok(self.root.join(bucket))
    }

    fn sidecar_path(&self, record: &ObjectRecord) -> anyhow::Result<PathBuf> {
        if !is_blob_name(&record.blob) {
            anyhow::bail!("invalid blob name: {}", record.blob);
        }
        Ok(self
            .bucket_dir(&record.bucket)?
            .join(format!("{}.json", record.blob)))
    }
}

/// Serialize `value` into `path` atomically (temp file, fsync, rename).
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("record path has no parent: {}", path.display()))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer(&mut temp, value)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl MetadataStore for SidecarMetadataStore {
    fn put_bucket(
        &self,
        record: &BucketRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            let dir = self.bucket_dir(&record.name)?;
            blocking(move || {
                std::fs::create_dir_all(&dir)?;
                write_json_atomic(&dir.join(BUCKET_RECORD), &record)
            })
            .await
        })
    }

    fn delete_bucket(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let dir = self.bucket_dir(&name)?;
            blocking(move || {
                // The bucket record goes first so a half-finished delete is
                // not resurrected as a bucket on restart.
                remove_if_exists(&dir.join(BUCKET_RECORD))?;
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".json") {
                        remove_if_exists(&entry.path())?;
                    }
                }
                Ok(())
            })
            .await
        })
    }

    fn load_buckets(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BucketRecord>>> + Send + '_>> {
        let root = self.root.clone();
        Box::pin(async move {
            blocking(move || {
                let mut buckets = Vec::new();
                for entry in std::fs::read_dir(&root)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') || !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let path = entry.path().join(BUCKET_RECORD);
                    if !path.exists() {
                        warn!(dir = %name, "directory without bucket record ignored");
                        continue;
                    }
                    let record: BucketRecord = read_json(&path)?;
                    if record.name != name {
                        warn!(dir = %name, record = %record.name, "bucket record name mismatch, skipping");
                        continue;
                    }
                    buckets.push(record);
                }
                Ok(buckets)
            })
            .await
        })
    }

    fn put_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            let path = self.sidecar_path(&record)?;
            blocking(move || write_json_atomic(&path, &record)).await
        })
    }

    fn delete_object(
        &self,
        record: &ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.sidecar_path(record);
        Box::pin(async move {
            let path = path?;
            blocking(move || remove_if_exists(&path)).await
        })
    }

    fn load_objects(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let dir = self.bucket_dir(&bucket)?;
            blocking(move || {
                let mut records = Vec::new();
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Some(blob) = name.strip_suffix(".json") else {
                        continue;
                    };
                    if !is_blob_name(blob) {
                        continue;
                    }
                    match read_json::<ObjectRecord>(&entry.path()) {
                        Ok(record) if record.blob == blob && record.bucket == bucket => {
                            records.push(record)
                        }
                        Ok(_) => warn!(bucket = %bucket, sidecar = %name, "sidecar does not match its file name, skipping"),
                        Err(e) => warn!(bucket = %bucket, sidecar = %name, "unreadable sidecar skipped: {e}"),
                    }
                }
                Ok(records)
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::new_blob_name;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_store() -> (SidecarMetadataStore, TempDir) {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let store = SidecarMetadataStore::new(tmp.path()).expect("failed to create store");
        (store, tmp)
    }

    fn make_bucket(name: &str) -> BucketRecord {
        BucketRecord {
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn make_object(bucket: &str, key: &str) -> ObjectRecord {
        let mut user_metadata = BTreeMap::new();
        user_metadata.insert("origin".to_string(), "test".to_string());
        ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: 18,
            etag: "\"d41d8cd98f00b204e9800998ecf8427e\"".to_string(),
            content_type: "text/plain".to_string(),
            user_metadata,
            last_modified: Utc::now(),
            blob: new_blob_name(),
        }
    }

    #[tokio::test]
    async fn test_bucket_persistence() {
        let (store, tmp) = test_store();
        store.put_bucket(&make_bucket("persist-bucket")).await.unwrap();
        std::fs::create_dir_all(tmp.path().join("stray-dir")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".tmp")).unwrap();

        let reopened = SidecarMetadataStore::new(tmp.path()).unwrap();
        let buckets = reopened.load_buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "persist-bucket");
    }

    #[tokio::test]
    async fn test_object_sidecar_roundtrip() {
        let (store, tmp) = test_store();
        store.put_bucket(&make_bucket("b")).await.unwrap();
        let rec = make_object("b", "dir/hello.txt");
        store.put_object(&rec).await.unwrap();
        assert!(tmp
            .path()
            .join("b")
            .join(format!("{}.json", rec.blob))
            .is_file());

        let loaded = store.load_objects("b").await.unwrap();
        assert_eq!(loaded, vec![rec.clone()]);

        store.delete_object(&rec).await.unwrap();
        store.delete_object(&rec).await.unwrap();
        assert!(store.load_objects("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_is_skipped() {
        let (store, tmp) = test_store();
        store.put_bucket(&make_bucket("b")).await.unwrap();
        let good = make_object("b", "good");
        store.put_object(&good).await.unwrap();
        std::fs::write(
            tmp.path().join("b").join(format!("{}.json", new_blob_name())),
            b"{not json",
        )
        .unwrap();

        let loaded = store.load_objects("b").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "good");
    }

    #[tokio::test]
    async fn test_delete_bucket_removes_records() {
        let (store, tmp) = test_store();
        store.put_bucket(&make_bucket("b")).await.unwrap();
        store.put_object(&make_object("b", "k")).await.unwrap();
        store.delete_bucket("b").await.unwrap();

        assert!(!tmp.path().join("b").join(BUCKET_RECORD).exists());
        assert!(store.load_buckets().await.unwrap().is_empty());
        store.delete_bucket("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_blob_names() {
        let (store, _tmp) = test_store();
        store.put_bucket(&make_bucket("b")).await.unwrap();
        let mut rec = make_object("b", "k");
        rec.blob = "../escape".into();
        assert!(store.put_object(&rec).await.is_err());
    }
}
