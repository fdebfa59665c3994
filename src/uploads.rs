//! Multipart upload assembler.
//!
//! Open uploads live in an in-process arena keyed by upload id.  Part
//! bodies go straight to the blob store's multipart scratch area; only
//! `complete` promotes them, by assembling a staged body and committing it
//! exactly like a single PUT.  Nothing an upload does is visible in the
//! bucket until that commit, and nothing survives a restart.
//!
//! Each open upload holds a [`WriteTicket`], so a bucket with uploads in
//! progress cannot be deleted.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::S3Error;
use crate::metadata::store::ObjectRecord;
use crate::registry::{BucketRegistry, WriteTicket};
use crate::storage::backend::{ByteStream, StorageBackend};
use crate::store::{validate_key, ObjectAttributes, ObjectStore};

/// Highest part number S3 allows.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// One uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// A part named in a CompleteMultipartUpload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

struct UploadState {
    parts: BTreeMap<u32, PartInfo>,
    last_activity: Instant,
    /// Set once a complete or abort has claimed the upload.
    closed: bool,
}

/// An open multipart upload.
pub struct Upload {
    pub id: String,
    pub key: String,
    pub attrs: ObjectAttributes,
    pub initiated: DateTime<Utc>,
    state: Mutex<UploadState>,
    /// Part uploads hold this shared while streaming; complete and abort
    /// take it exclusively to claim the upload, so no part can change
    /// underneath an assembly.
    writers: tokio::sync::RwLock<()>,
    /// One lock per part number, held from streaming until the part is
    /// recorded, so the stored file and its listed ETag always agree.
    part_locks: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
    ticket: WriteTicket,
}

impl Upload {
    pub fn bucket(&self) -> &str {
        self.ticket.bucket().name()
    }

    /// Uploaded parts in part-number order.
    pub fn parts(&self) -> Vec<PartInfo> {
        self.state.lock().parts.values().cloned().collect()
    }

    fn part_lock(&self, part_number: u32) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.part_locks.lock().entry(part_number).or_default())
    }

    fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Claim the upload for abort.
    async fn close(&self) -> Result<(), S3Error> {
        let _exclusive = self.writers.write().await;
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.no_such_upload());
        }
        state.closed = true;
        Ok(())
    }

    fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.last_activity = Instant::now();
    }

    fn no_such_upload(&self) -> S3Error {
        S3Error::NoSuchUpload {
            upload_id: self.id.clone(),
        }
    }
}

fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Check a completion list against the uploaded parts.
///
/// The list must name parts 1..=N in order; every named part must exist
/// and carry the stored ETag.
fn check_completion(
    requested: &[CompletedPart],
    uploaded: &BTreeMap<u32, PartInfo>,
) -> Result<(), S3Error> {
    if requested.is_empty() {
        return Err(S3Error::InvalidPartSequence);
    }
    for (i, part) in requested.iter().enumerate() {
        if part.part_number as usize != i + 1 {
            return Err(S3Error::InvalidPartSequence);
        }
    }
    for part in requested {
        let stored = uploaded
            .get(&part.part_number)
            .ok_or(S3Error::IncompleteUpload {
                part_number: part.part_number,
            })?;
        if normalize_etag(&stored.etag) != normalize_etag(&part.etag) {
            return Err(S3Error::InvalidPart {
                message: format!(
                    "The ETag for part {} does not match the uploaded part.",
                    part.part_number
                ),
            });
        }
    }
    Ok(())
}

/// Arena of open multipart uploads.
pub struct UploadAssembler {
    arena: RwLock<HashMap<String, Arc<Upload>>>,
    registry: Arc<BucketRegistry>,
    storage: Arc<dyn StorageBackend>,
    store: Arc<ObjectStore>,
}

impl UploadAssembler {
    pub fn new(
        registry: Arc<BucketRegistry>,
        storage: Arc<dyn StorageBackend>,
        store: Arc<ObjectStore>,
    ) -> Self {
        Self {
            arena: RwLock::new(HashMap::new()),
            registry,
            storage,
            store,
        }
    }

    /// Open a new upload for `key`.
    pub async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        attrs: ObjectAttributes,
    ) -> Result<Arc<Upload>, S3Error> {
        validate_key(key)?;
        let ticket = self.registry.get(bucket)?.begin_write().await?;
        let upload = Arc::new(Upload {
            id: uuid::Uuid::new_v4().simple().to_string(),
            key: key.to_string(),
            attrs,
            initiated: Utc::now(),
            state: Mutex::new(UploadState {
                parts: BTreeMap::new(),
                last_activity: Instant::now(),
                closed: false,
            }),
            writers: tokio::sync::RwLock::new(()),
            part_locks: Mutex::new(HashMap::new()),
            ticket,
        });
        self.arena
            .write()
            .insert(upload.id.clone(), Arc::clone(&upload));
        debug!(bucket = %bucket, key = %key, upload_id = %upload.id, "multipart upload initiated");
        Ok(upload)
    }

    /// Find an open upload, checking it belongs to `bucket`/`key`.
    fn lookup(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Arc<Upload>, S3Error> {
        self.arena
            .read()
            .get(upload_id)
            .filter(|u| u.bucket() == bucket && u.key == key)
            .cloned()
            .ok_or_else(|| S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })
    }

    /// Store one part, replacing any earlier part with the same number.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Result<PartInfo, S3Error> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(S3Error::InvalidArgument {
                message: format!(
                    "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
                ),
            });
        }
        let upload = self.lookup(bucket, key, upload_id)?;
        let _writing = upload.writers.read().await;
        if upload.state.lock().closed {
            return Err(upload.no_such_upload());
        }
        let slot = upload.part_lock(part_number);
        let _part = slot.lock().await;

        let staged = self
            .storage
            .put_part(&upload.id, part_number, body)
            .await
            .map_err(S3Error::from_transfer)?;
        let info = PartInfo {
            part_number,
            size: staged.size,
            etag: staged.etag,
            last_modified: Utc::now(),
        };
        let mut state = upload.state.lock();
        state.parts.insert(part_number, info.clone());
        state.last_activity = Instant::now();
        Ok(info)
    }

    /// Assemble the named parts and commit them as the object.
    pub async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Arc<ObjectRecord>, S3Error> {
        let upload = self.lookup(bucket, key, upload_id)?;
        {
            let _exclusive = upload.writers.write().await;
            let mut state = upload.state.lock();
            if state.closed {
                return Err(upload.no_such_upload());
            }
            check_completion(parts, &state.parts)?;
            state.closed = true;
        }

        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        let staged = match self.storage.assemble_parts(&upload.id, &numbers).await {
            Ok(staged) => staged,
            Err(err) => {
                upload.reopen();
                return Err(err.into());
            }
        };
        let record = match self
            .store
            .commit_staged(&upload.ticket, &upload.key, staged, upload.attrs.clone())
            .await
        {
            Ok(record) => record,
            Err(err) => {
                upload.reopen();
                return Err(err);
            }
        };

        self.arena.write().remove(&upload.id);
        if let Err(err) = self.storage.delete_parts(&upload.id).await {
            warn!(upload_id = %upload.id, "failed to remove parts after completion: {err}");
        }
        info!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload.id,
            parts = parts.len(),
            size = record.size,
            "multipart upload completed"
        );
        Ok(record)
    }

    /// Discard an upload and all its parts.
    pub async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), S3Error> {
        let upload = self.lookup(bucket, key, upload_id)?;
        self.discard(&upload).await
    }

    async fn discard(&self, upload: &Upload) -> Result<(), S3Error> {
        upload.close().await?;
        self.arena.write().remove(&upload.id);
        self.storage.delete_parts(&upload.id).await?;
        debug!(upload_id = %upload.id, "multipart upload aborted");
        Ok(())
    }

    /// An open upload, for ListParts.
    pub fn get(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Arc<Upload>, S3Error> {
        self.registry.get(bucket)?;
        self.lookup(bucket, key, upload_id)
    }

    /// Open uploads in `bucket` under `prefix`, ordered by key then
    /// initiation time.
    pub fn list_uploads(&self, bucket: &str, prefix: &str) -> Result<Vec<Arc<Upload>>, S3Error> {
        self.registry.get(bucket)?;
        let mut uploads: Vec<Arc<Upload>> = self
            .arena
            .read()
            .values()
            .filter(|u| u.bucket() == bucket && u.key.starts_with(prefix))
            .cloned()
            .collect();
        uploads.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.initiated.cmp(&b.initiated))
                .then(a.id.cmp(&b.id))
        });
        Ok(uploads)
    }

    /// Number of open uploads.
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().is_empty()
    }

    /// Abort every upload idle for longer than `max_idle`. Returns how many
    /// were aborted.
    pub async fn reap_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<Arc<Upload>> = self
            .arena
            .read()
            .values()
            .filter(|u| u.idle_for() > max_idle)
            .cloned()
            .collect();

        let mut reaped = 0;
        for upload in stale {
            match self.discard(&upload).await {
                Ok(()) => reaped += 1,
                // Claimed by a concurrent complete or abort.
                Err(S3Error::NoSuchUpload { .. }) => {}
                Err(err) => warn!(upload_id = %upload.id, "failed to reap stale upload: {err}"),
            }
        }
        if reaped > 0 {
            info!(reaped, "aborted stale multipart uploads");
        }
        reaped
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval` until the
    /// returned task is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let assembler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing can be stale yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                assembler.reap_stale(max_idle).await;
            }
        })
    }
}
