//! Abstract blob storage trait.
//!
//! Every storage backend must implement [`StorageBackend`].  Bodies move
//! through the trait as byte streams so neither side has to buffer a whole
//! object.  Writes are two-phase: a body is first *staged* (streamed into a
//! private scratch area while its MD5 is computed) and only later
//! *committed* under a blob name inside a bucket, so a failed or abandoned
//! write never becomes visible.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// A boxed stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A body that has been fully received but is not yet visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlob {
    /// Backend-private handle for the staged bytes.
    pub id: String,
    /// Number of bytes staged.
    pub size: u64,
    /// Quoted ETag of the staged bytes.
    pub etag: String,
}

/// An open, readable blob.
pub struct BlobReader {
    /// Number of bytes the stream will yield.
    pub len: u64,
    /// The body.
    pub stream: ByteStream,
}

/// Inclusive byte range `(start, end)` within a blob.
pub type ByteRange = (u64, u64);

/// Async blob storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Create the storage area for `bucket`. Idempotent.
    fn create_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Remove the storage area for `bucket` and anything left in it.
    fn delete_bucket(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stream `body` into the staging area.
    fn stage(
        &self,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>>;

    /// Make a staged body visible as `blob` inside `bucket`.
    fn commit(
        &self,
        staged: &StagedBlob,
        bucket: &str,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Drop a staged body that will never be committed.
    fn discard(
        &self,
        staged: &StagedBlob,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Open `blob` for reading, optionally restricted to `range`.
    ///
    /// The returned stream reflects the blob as it was when opened, even if
    /// the blob is deleted while the stream is being consumed.
    fn open(
        &self,
        bucket: &str,
        blob: &str,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobReader>> + Send + '_>>;

    /// Delete `blob`. Idempotent.
    fn delete(
        &self,
        bucket: &str,
        blob: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Stream one multipart part into the upload's scratch area, replacing
    /// any earlier part with the same number.
    fn put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>>;

    /// Concatenate `parts` (in the given order) into a new staged body whose
    /// ETag is the multipart composite ETag.
    fn assemble_parts(
        &self,
        upload_id: &str,
        parts: &[u32],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StagedBlob>> + Send + '_>>;

    /// Delete all part data associated with a multipart upload. Idempotent.
    fn delete_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Drop every staged body and multipart scratch area. Returns how many
    /// entries were removed.
    fn purge_scratch(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>>;

    /// Delete blobs in `bucket` whose names are not in `keep`. Returns how
    /// many were removed.
    fn remove_unreferenced(
        &self,
        bucket: &str,
        keep: &HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>>;
}

/// Generate a fresh blob name.
pub fn new_blob_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Whether `name` has the shape produced by [`new_blob_name`].
pub fn is_blob_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Quote a hex digest as an S3 ETag.
pub fn quote_etag(md5: &[u8]) -> String {
    format!("\"{}\"", hex::encode(md5))
}

/// Composite ETag of a multipart object: MD5 over the concatenated binary
/// part digests, suffixed with the part count.
pub fn composite_etag(part_digests: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    format!("\"{}-{}\"", hex::encode(hasher.finalize()), part_digests.len())
}

/// Wrap an in-memory body as a single-chunk [`ByteStream`].
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data: Bytes = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a [`ByteStream`] into one contiguous buffer.
pub async fn collect_stream(mut body: ByteStream) -> std::io::Result<Bytes> {
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Clamp an inclusive range to a blob of `len` bytes.
pub(crate) fn clamp_range(range: Option<ByteRange>, len: u64) -> anyhow::Result<(u64, u64)> {
    match range {
        None => Ok((0, len)),
        Some((start, end)) => {
            if start > end || end >= len {
                anyhow::bail!("range {start}-{end} outside blob of {len} bytes");
            }
            Ok((start, end - start + 1))
        }
    }
}
