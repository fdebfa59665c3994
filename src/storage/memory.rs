//! In-memory storage backend.
//!
//! Blobs, staged bodies and multipart parts are held in hash maps behind
//! `parking_lot` locks.  Nothing survives a restart; this backend is meant
//! for tests and throwaway instances.  Bodies are still received as
//! streams, but are necessarily held whole once staged.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use super::backend::{
    clamp_range, composite_etag, quote_etag, stream_from_bytes, BlobReader, ByteRange, ByteStream,
    StagedBlob, StorageBackend,
};

/// Memory-resident blob storage.
#[derive(Default)]
pub struct MemoryBackend {
    /// bucket -> blob -> bytes.
    buckets: RwLock<HashMap<String, HashMap<String, Bytes>>>,
    /// staged id -> bytes.
    staged: RwLock<HashMap<String, Bytes>>,
    /// upload id -> part number -> (bytes, md5).
    parts: RwLock<HashMap<String, BTreeMap<u32, (Bytes, [u8; 16])>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drain `body`, hashing as it arrives.
async fn receive(mut body: ByteStream) -> anyhow::Result<(Bytes, [u8; 16])> {
    let mut buf = BytesMut::new();
    let mut hasher = Md5::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), hasher.finalize().into()))
}

impl StorageBackend for MemoryBackend {
    fn create_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            self.buckets.write().entry(bucket).or_default();
            Ok(())
        })
    }

    fn delete_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            self.buckets.write().remove(&bucket);
            Ok(())
        })
    }

    fn stage(
        &self,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>> {
        Box::pin(async move {
            let (data, md5) = receive(body).await?;
            let id = uuid::Uuid::new_v4().simple().to_string();
            let staged = StagedBlob {
                id: id.clone(),
                size: data.len() as u64,
                etag: quote_etag(&md5),
            };
            self.staged.write().insert(id, data);
            Ok(staged)
        })
    }

    fn commit(
        &self,
        staged: &StagedBlob,
        bucket: &str,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = staged.id.clone();
        let bucket = bucket.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            let data = self
                .staged
                .write()
                .remove(&id)
                .ok_or_else(|| anyhow::anyhow!("staged body {id} not found"))?;
            let mut buckets = self.buckets.write();
            let Some(blobs) = buckets.get_mut(&bucket) else {
                // Put the body back so the caller can still discard it.
                self.staged.write().insert(id, data);
                anyhow::bail!("bucket storage {bucket} does not exist");
            };
            blobs.insert(blob, data);
            Ok(())
        })
    }

    fn discard(
        &self,
        staged: &StagedBlob,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = staged.id.clone();
        Box::pin(async move {
            self.staged.write().remove(&id);
            Ok(())
        })
    }

    fn open(
        &self,
        bucket: &str,
        blob: &str,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobReader>> + Send + '_>> {
        let bucket = bucket.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            // `Bytes` is reference counted, so the reader keeps this version
            // alive regardless of later deletes.
            let data = self
                .buckets
                .read()
                .get(&bucket)
                .and_then(|blobs| blobs.get(&blob))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("blob {bucket}/{blob} not found"))?;
            let (offset, len) = clamp_range(range, data.len() as u64)?;
            let slice = data.slice(offset as usize..(offset + len) as usize);
            Ok(BlobReader {
                len,
                stream: stream_from_bytes(slice),
            })
        })
    }

    fn delete(
        &self,
        bucket: &str,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        let blob = blob.to_string();
        Box::pin(async move {
            if let Some(blobs) = self.buckets.write().get_mut(&bucket) {
                blobs.remove(&blob);
            }
            Ok(())
        })
    }

    fn put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let (data, md5) = receive(body).await?;
            let staged = StagedBlob {
                id: format!("{upload_id}/{part_number}"),
                size: data.len() as u64,
                etag: quote_etag(&md5),
            };
            self.parts
                .write()
                .entry(upload_id)
                .or_default()
                .insert(part_number, (data, md5));
            Ok(staged)
        })
    }

    fn assemble_parts(
        &self,
        upload_id: &str,
        parts: &[u32],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut buf = BytesMut::new();
            let mut digests = Vec::with_capacity(parts.len());
            {
                let all = self.parts.read();
                let table = all
                    .get(&upload_id)
                    .ok_or_else(|| anyhow::anyhow!("no parts for upload {upload_id}"))?;
                for n in &parts {
                    let (data, md5) = table
                        .get(n)
                        .ok_or_else(|| anyhow::anyhow!("Failed to open part {n}"))?;
                    buf.extend_from_slice(data);
                    digests.push(*md5);
                }
            }
            let data = buf.freeze();
            let id = uuid::Uuid::new_v4().simple().to_string();
            let staged = StagedBlob {
                id: id.clone(),
                size: data.len() as u64,
                etag: composite_etag(&digests),
            };
            self.staged.write().insert(id, data);
            Ok(staged)
        })
    }

    fn delete_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            self.parts.write().remove(&upload_id);
            Ok(())
        })
    }

    fn purge_scratch(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        Box::pin(async move {
            let mut staged = self.staged.write();
            let mut parts = self.parts.write();
            let removed = staged.len() + parts.len();
            staged.clear();
            parts.clear();
            Ok(removed)
        })
    }

    fn remove_unreferenced(
        &self,
        bucket: &str,
        keep: &HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        let bucket = bucket.to_string();
        let keep = keep.clone();
        Box::pin(async move {
            let mut buckets = self.buckets.write();
            let Some(blobs) = buckets.get_mut(&bucket) else {
                return Ok(0);
            };
            let before = blobs.len();
            blobs.retain(|name, _| keep.contains(name));
            Ok(before - blobs.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{collect_stream, new_blob_name};

    #[tokio::test]
    async fn test_commit_and_range_read() {
        let backend = MemoryBackend::new();
        backend.create_bucket("b").await.unwrap();
        let staged = backend.stage(stream_from_bytes("0123456789")).await.unwrap();
        let blob = new_blob_name();
        backend.commit(&staged, "b", &blob).await.unwrap();

        let full = backend.open("b", &blob, None).await.unwrap();
        assert_eq!(collect_stream(full.stream).await.unwrap(), "0123456789");

        let part = backend.open("b", &blob, Some((7, 9))).await.unwrap();
        assert_eq!(part.len, 3);
        assert_eq!(collect_stream(part.stream).await.unwrap(), "789");
    }

    #[tokio::test]
    async fn test_commit_into_missing_bucket_fails() {
        let backend = MemoryBackend::new();
        let staged = backend.stage(stream_from_bytes("x")).await.unwrap();
        assert!(backend.commit(&staged, "nope", &new_blob_name()).await.is_err());
        backend.discard(&staged).await.unwrap();
        assert!(backend.staged.read().is_empty());
    }

    #[tokio::test]
    async fn test_assemble_matches_local_etag_rules() {
        let backend = MemoryBackend::new();
        backend.put_part("u", 1, stream_from_bytes("ab")).await.unwrap();
        backend.put_part("u", 2, stream_from_bytes("cd")).await.unwrap();
        let staged = backend.assemble_parts("u", &[1, 2]).await.unwrap();
        assert_eq!(staged.size, 4);

        let a: [u8; 16] = Md5::digest(b"ab").into();
        let c: [u8; 16] = Md5::digest(b"cd").into();
        assert_eq!(staged.etag, composite_etag(&[a, c]));
        assert!(backend.assemble_parts("u", &[1, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_unreferenced() {
        let backend = MemoryBackend::new();
        backend.create_bucket("b").await.unwrap();
        let keep_name = new_blob_name();
        for name in [keep_name.clone(), new_blob_name()] {
            let staged = backend.stage(stream_from_bytes("x")).await.unwrap();
            backend.commit(&staged, "b", &name).await.unwrap();
        }
        let keep: HashSet<String> = [keep_name].into_iter().collect();
        assert_eq!(backend.remove_unreferenced("b", &keep).await.unwrap(), 1);
    }
}
