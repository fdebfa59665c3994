//! Local filesystem storage backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! .tmp/<id>                    staged bodies
//! .multipart/<upload_id>/<n>   multipart parts
//! <bucket>/<blob>              committed bodies
//! ```
//!
//! All writes follow crash-only design: write to a temp file, fsync,
//! rename.  Anything left in `.tmp` or `.multipart` after a crash is
//! garbage and is removed by [`StorageBackend::purge_scratch`] at startup.

use futures::StreamExt;
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::backend::{
    clamp_range, composite_etag, is_blob_name, quote_etag, BlobReader, ByteRange, ByteStream,
    StagedBlob, StorageBackend,
};

const TMP_DIR: &str = ".tmp";
const MULTIPART_DIR: &str = ".multipart";

/// Stores blobs on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory and its scratch areas are created if they do not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        std::fs::create_dir_all(root.join(MULTIPART_DIR))?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> anyhow::Result<PathBuf> {
        check_segment(bucket)?;
        if bucket.starts_with('.') {
            anyhow::bail!("bucket name may not start with '.': {bucket}");
        }
        Ok(self.root.join(bucket))
    }

    fn blob_path(&self, bucket: &str, blob: &str) -> anyhow::Result<PathBuf> {
        if !is_blob_name(blob) {
            anyhow::bail!("invalid blob name: {blob}");
        }
        Ok(self.bucket_dir(bucket)?.join(blob))
    }

    fn staged_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        check_segment(id)?;
        Ok(self.root.join(TMP_DIR).join(id))
    }

    fn part_dir(&self, upload_id: &str) -> anyhow::Result<PathBuf> {
        check_segment(upload_id)?;
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    /// Allocate a fresh temp file name under `.tmp/`.
    fn temp_path(&self) -> (String, PathBuf) {
        let id = format!("tmp-{}", uuid::Uuid::new_v4().simple());
        let path = self.root.join(TMP_DIR).join(&id);
        (id, path)
    }
}

/// Reject anything that could escape its parent directory.
fn check_segment(segment: &str) -> anyhow::Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        anyhow::bail!("Path traversal detected in storage segment: {segment}");
    }
    Ok(())
}

/// Stream `body` into a new file at `path`, fsync it, and return its size
/// and MD5. The file is removed if anything fails.
async fn write_stream(path: &Path, mut body: ByteStream) -> anyhow::Result<(u64, [u8; 16])> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Md5::new();
    let mut size = 0u64;

    let written: anyhow::Result<()> = async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        drop(file);
        remove_file_if_exists(path).await?;
        return Err(err);
    }
    Ok((size, hasher.finalize().into()))
}

async fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl StorageBackend for LocalBackend {
    fn create_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let dir = self.bucket_dir(&bucket)?;
            tokio::fs::create_dir_all(&dir).await?;
            Ok(())
        })
    }

    fn delete_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let dir = self.bucket_dir(&bucket)?;
            remove_dir_if_exists(&dir).await
        })
    }

    fn stage(
        &self,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>> {
        Box::pin(async move {
            let (id, path) = self.temp_path();
            let (size, md5) = write_stream(&path, body).await?;
            Ok(StagedBlob {
                id,
                size,
                etag: quote_etag(&md5),
            })
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
            let from = self.staged_path(&id)?;
            let to = self.blob_path(&bucket, &blob)?;
            tokio::fs::rename(&from, &to).await?;
            debug!(bucket = %bucket, blob = %blob, "blob committed");
            Ok(())
        })
    }

    fn discard(
        &self,
        staged: &StagedBlob,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = staged.id.clone();
        Box::pin(async move {
            let path = self.staged_path(&id)?;
            remove_file_if_exists(&path).await
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
            let path = self.blob_path(&bucket, &blob)?;
            // Once open, the handle keeps reading this inode even if a
            // later commit renames a new blob over the name or deletes it.
            let mut file = tokio::fs::File::open(&path).await?;
            let total = file.metadata().await?.len();
            let (offset, len) = clamp_range(range, total)?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            Ok(BlobReader {
                len,
                stream: Box::pin(ReaderStream::new(file.take(len))),
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
            let path = self.blob_path(&bucket, &blob)?;
            remove_file_if_exists(&path).await
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
            let part_dir = self.part_dir(&upload_id)?;
            tokio::fs::create_dir_all(&part_dir).await?;

            let (_, tmp_path) = self.temp_path();
            let (size, md5) = write_stream(&tmp_path, body).await?;
            let final_path = part_dir.join(part_number.to_string());
            if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
                remove_file_if_exists(&tmp_path).await?;
                return Err(err.into());
            }

            Ok(StagedBlob {
                id: format!("{upload_id}/{part_number}"),
                size,
                etag: quote_etag(&md5),
            })
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
            let part_dir = self.part_dir(&upload_id)?;
            let (id, tmp_path) = self.temp_path();
            let mut output = tokio::fs::File::create(&tmp_path).await?;

            let mut digests: Vec<[u8; 16]> = Vec::with_capacity(parts.len());
            let mut total_size = 0u64;

            let assembled: anyhow::Result<()> = async {
                let mut buf = vec![0u8; 64 * 1024];
                for part_number in &parts {
                    let part_path = part_dir.join(part_number.to_string());
                    let mut part = tokio::fs::File::open(&part_path).await.map_err(|e| {
                        anyhow::anyhow!("Failed to open part {part_number}: {e}")
                    })?;
                    let mut hasher = Md5::new();
                    loop {
                        let n = part.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buf[..n]);
                        output.write_all(&buf[..n]).await?;
                        total_size += n as u64;
                    }
                    digests.push(hasher.finalize().into());
                }
                output.flush().await?;
                output.sync_all().await?;
                Ok(())
            }
            .await;

            drop(output);
            if let Err(err) = assembled {
                remove_file_if_exists(&tmp_path).await?;
                return Err(err);
            }

            Ok(StagedBlob {
                id,
                size: total_size,
                etag: composite_etag(&digests),
            })
        })
    }

    fn delete_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let part_dir = self.part_dir(&upload_id)?;
            remove_dir_if_exists(&part_dir).await
        })
    }

    fn purge_scratch(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        Box::pin(async move {
            let mut removed = 0;
            for area in [TMP_DIR, MULTIPART_DIR] {
                let dir = self.root.join(area);
                tokio::fs::create_dir_all(&dir).await?;
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        remove_dir_if_exists(&path).await?;
                    } else {
                        remove_file_if_exists(&path).await?;
                    }
                    removed += 1;
                }
            }
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
            let dir = self.bucket_dir(&bucket)?;
            let mut removed = 0;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_blob_name(&name) && !keep.contains(&name) {
                    remove_file_if_exists(&entry.path()).await?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{collect_stream, new_blob_name, stream_from_bytes};
    use bytes::Bytes;

    fn chunked(chunks: &[&'static [u8]]) -> ByteStream {
        let items: Vec<std::io::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn read_blob(backend: &LocalBackend, bucket: &str, blob: &str) -> Vec<u8> {
        let reader = backend.open(bucket, blob, None).await.unwrap();
        collect_stream(reader.stream).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_stage_commit_open() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();

        let staged = backend
            .stage(chunked(&[b"hello ", b"world"]))
            .await
            .unwrap();
        assert_eq!(staged.size, 11);

        let blob = new_blob_name();
        backend.commit(&staged, "bucket", &blob).await.unwrap();
        assert_eq!(read_blob(&backend, "bucket", &blob).await, b"hello world");
        assert!(dir.path().join("bucket").join(&blob).is_file());
    }

    #[tokio::test]
    async fn test_etag_is_md5() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let staged = backend.stage(stream_from_bytes(Bytes::new())).await.unwrap();
        assert_eq!(staged.etag, "\"d41d8cd98f00b204e9800998ecf8427e\"");
        assert_eq!(staged.size, 0);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();

        let items: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];
        let result = backend.stage(Box::pin(futures::stream::iter(items))).await;
        assert!(result.is_err());

        let leftovers = std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_discard_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let staged = backend.stage(stream_from_bytes("data")).await.unwrap();
        backend.discard(&staged).await.unwrap();
        backend.discard(&staged).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_open_range() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();
        let staged = backend.stage(stream_from_bytes("0123456789")).await.unwrap();
        let blob = new_blob_name();
        backend.commit(&staged, "bucket", &blob).await.unwrap();

        let reader = backend.open("bucket", &blob, Some((2, 5))).await.unwrap();
        assert_eq!(reader.len, 4);
        assert_eq!(collect_stream(reader.stream).await.unwrap(), "2345");
    }

    #[tokio::test]
    async fn test_open_reader_survives_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();
        let staged = backend.stage(stream_from_bytes("snapshot")).await.unwrap();
        let blob = new_blob_name();
        backend.commit(&staged, "bucket", &blob).await.unwrap();

        let reader = backend.open("bucket", &blob, None).await.unwrap();
        backend.delete("bucket", &blob).await.unwrap();
        assert_eq!(collect_stream(reader.stream).await.unwrap(), "snapshot");
        assert!(backend.open("bucket", &blob, None).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();
        let blob = new_blob_name();
        backend.delete("bucket", &blob).await.unwrap();
        backend.delete("bucket", &blob).await.unwrap();
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.create_bucket("..").await.is_err());
        assert!(backend.create_bucket("a/b").await.is_err());
        assert!(backend.open("bucket", "../etc/passwd", None).await.is_err());
        assert!(backend.delete_parts("../x").await.is_err());
    }

    #[tokio::test]
    async fn test_parts_assemble_in_given_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();

        // Upload out of order; assembly follows the list it is given.
        let p2 = backend
            .put_part("upload1", 2, stream_from_bytes("world"))
            .await
            .unwrap();
        let p1 = backend
            .put_part("upload1", 1, stream_from_bytes("hello "))
            .await
            .unwrap();
        assert_eq!(p1.size, 6);
        assert_eq!(p2.size, 5);

        let staged = backend.assemble_parts("upload1", &[1, 2]).await.unwrap();
        assert_eq!(staged.size, 11);
        assert!(staged.etag.ends_with("-2\""));

        let d1: [u8; 16] = Md5::digest(b"hello ").into();
        let d2: [u8; 16] = Md5::digest(b"world").into();
        assert_eq!(staged.etag, composite_etag(&[d1, d2]));

        let blob = new_blob_name();
        backend.commit(&staged, "bucket", &blob).await.unwrap();
        assert_eq!(read_blob(&backend, "bucket", &blob).await, b"hello world");

        backend.delete_parts("upload1").await.unwrap();
        assert!(!dir.path().join(MULTIPART_DIR).join("upload1").exists());
    }

    #[tokio::test]
    async fn test_part_reupload_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend
            .put_part("u", 1, stream_from_bytes("first"))
            .await
            .unwrap();
        backend
            .put_part("u", 1, stream_from_bytes("second"))
            .await
            .unwrap();
        let staged = backend.assemble_parts("u", &[1]).await.unwrap();
        assert_eq!(staged.size, 6);
    }

    #[tokio::test]
    async fn test_assemble_missing_part_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend
            .put_part("u", 1, stream_from_bytes("only"))
            .await
            .unwrap();
        assert!(backend.assemble_parts("u", &[1, 2]).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_purge_scratch_and_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();

        backend.stage(stream_from_bytes("orphan")).await.unwrap();
        backend
            .put_part("stale", 1, stream_from_bytes("part"))
            .await
            .unwrap();
        assert_eq!(backend.purge_scratch().await.unwrap(), 2);

        let kept = new_blob_name();
        let dropped = new_blob_name();
        for blob in [&kept, &dropped] {
            let staged = backend.stage(stream_from_bytes("x")).await.unwrap();
            backend.commit(&staged, "bucket", blob).await.unwrap();
        }
        std::fs::write(dir.path().join("bucket").join(".bucket.json"), "{}").unwrap();

        let keep: HashSet<String> = [kept.clone()].into_iter().collect();
        assert_eq!(backend.remove_unreferenced("bucket", &keep).await.unwrap(), 1);
        assert!(dir.path().join("bucket").join(&kept).exists());
        assert!(!dir.path().join("bucket").join(&dropped).exists());
        assert!(dir.path().join("bucket").join(".bucket.json").exists());
    }

    #[tokio::test]
    async fn test_delete_bucket_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        backend.create_bucket("bucket").await.unwrap();
        backend.delete_bucket("bucket").await.unwrap();
        assert!(!dir.path().join("bucket").exists());
        backend.delete_bucket("bucket").await.unwrap();
    }
}
