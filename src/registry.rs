//! Bucket registry: the namespace of live buckets.
//!
//! The registry is process-wide state built once at startup by
//! [`BucketRegistry::load`].  It is never guarded by a single global lock
//! across I/O: each [`Bucket`] serializes its own lifecycle, so work on
//! one bucket never waits on another.
//!
//! A bucket's lifecycle lock and in-flight counter cooperate to make
//! deletion safe: every write registers itself (under the shared lock)
//! before it streams anything, and deletion (under the exclusive lock)
//! refuses while any write is registered.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

use crate::errors::S3Error;
use crate::metadata::index::{KeyIndex, VersionedIndex};
use crate::metadata::store::{BucketRecord, MetadataStore, ObjectRecord};
use crate::storage::backend::StorageBackend;

/// Validate a bucket name according to S3 naming rules.
///
/// - 3 to 63 characters
/// - lowercase letters, digits, hyphens and periods only
/// - starts and ends with a letter or digit
/// - not formatted as an IPv4 address
/// - no `xn--` prefix, no `-s3alias` / `--ol-s3` suffix
pub fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let invalid = || S3Error::InvalidBucketName {
        name: name.to_string(),
    };

    if !(3..=63).contains(&name.len()) {
        return Err(invalid());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid());
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if looks_like_ipv4(name)
        || name.starts_with("xn--")
        || name.ends_with("-s3alias")
        || name.ends_with("--ol-s3")
    {
        return Err(invalid());
    }
    Ok(())
}

fn looks_like_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

// -- Per-key locks -----------------------------------------------------------

type KeyLock = tokio::sync::RwLock<()>;

struct LockTable {
    locks: HashMap<String, Weak<KeyLock>>,
    prune_at: usize,
}

/// Lazily created reader/writer locks, one per key.
///
/// Entries are weak, so a key's lock disappears once nobody holds it; the
/// table drops dead entries whenever it doubles in size.
pub struct KeyLocks {
    table: Mutex<LockTable>,
}

const MIN_PRUNE_AT: usize = 1024;

impl Default for KeyLocks {
    fn default() -> Self {
        Self {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }
}

impl KeyLocks {
    /// The lock for `key`, shared with every other current holder.
    pub fn lock_for(&self, key: &str) -> Arc<KeyLock> {
        let mut table = self.table.lock();
        if let Some(lock) = table.locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(KeyLock::new(()));
        table.locks.insert(key.to_string(), Arc::downgrade(&lock));
        if table.locks.len() >= table.prune_at {
            table.locks.retain(|_, weak| weak.strong_count() > 0);
            table.prune_at = (table.locks.len() * 2).max(MIN_PRUNE_AT);
        }
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table.lock().locks.len()
    }
}

// -- Buckets -----------------------------------------------------------------

/// One live bucket and its concurrency state.
pub struct Bucket {
    name: String,
    created_at: DateTime<Utc>,
    /// Current objects, published copy-on-write.
    pub index: VersionedIndex,
    /// Per-key commit locks.
    pub locks: KeyLocks,
    /// `true` while the bucket is live. Writers register under the shared
    /// lock; deletion flips it under the exclusive lock.
    lifecycle: tokio::sync::RwLock<bool>,
    in_flight: AtomicUsize,
}

impl Bucket {
    fn new(name: String, created_at: DateTime<Utc>, index: KeyIndex) -> Self {
        Self {
            name,
            created_at,
            index: VersionedIndex::new(index),
            locks: KeyLocks::default(),
            lifecycle: tokio::sync::RwLock::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Register a write against this bucket.
    ///
    /// Fails with `NoSuchBucket` if the bucket was deleted after the caller
    /// looked it up. The registration lasts until the ticket is dropped.
    pub async fn begin_write(self: &Arc<Self>) -> Result<WriteTicket, S3Error> {
        let live = self.lifecycle.read().await;
        if !*live {
            return Err(S3Error::NoSuchBucket {
                bucket: self.name.clone(),
            });
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(WriteTicket {
            bucket: Arc::clone(self),
        })
    }

    /// Writes currently registered (including open multipart uploads).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Proof that a write is registered with its bucket.
pub struct WriteTicket {
    bucket: Arc<Bucket>,
}

impl WriteTicket {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        self.bucket.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// -- Registry ----------------------------------------------------------------

/// Summary of what [`BucketRegistry::load`] found on disk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub buckets: usize,
    pub objects: usize,
    /// Records shadowed by a newer record for the same key.
    pub superseded: usize,
    /// Blobs no record referenced.
    pub orphans: usize,
}

/// Process-wide bucket namespace.
pub struct BucketRegistry {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    /// Names with a create in progress.
    reserved: Mutex<HashSet<String>>,
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
}

/// Releases a name reservation on every exit path of `create_bucket`.
struct Reservation<'a> {
    registry: &'a BucketRegistry,
    name: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.reserved.lock().remove(self.name);
    }
}

impl BucketRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            storage,
            metadata,
        }
    }

    /// Rebuild the registry from persisted records.
    ///
    /// Where a crash left two records for one key the newer wins and the
    /// other is removed; blobs that no surviving record references are
    /// deleted.
    pub async fn load(&self) -> anyhow::Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut loaded = HashMap::new();

        for bucket_record in self.metadata.load_buckets().await? {
            let name = bucket_record.name.clone();
            if validate_bucket_name(&name).is_err() {
                warn!(bucket = %name, "skipping bucket with invalid name");
                continue;
            }
            self.storage.create_bucket(&name).await?;

            let mut latest: BTreeMap<String, ObjectRecord> = BTreeMap::new();
            let mut superseded = Vec::new();
            for record in self.metadata.load_objects(&name).await? {
                let shadowed = latest
                    .get(&record.key)
                    .is_some_and(|current| current.is_newer_than(&record));
                if shadowed {
                    superseded.push(record);
                } else if let Some(previous) = latest.insert(record.key.clone(), record) {
                    superseded.push(previous);
                }
            }
            for record in &superseded {
                self.metadata.delete_object(record).await?;
            }

            let keep: HashSet<String> = latest.values().map(|r| r.blob.clone()).collect();
            let orphans = self.storage.remove_unreferenced(&name, &keep).await?;

            let mut index = KeyIndex::default();
            for (_, record) in latest {
                index.insert(Arc::new(record));
            }

            report.buckets += 1;
            report.objects += index.len();
            report.superseded += superseded.len();
            report.orphans += orphans;
            loaded.insert(
                name.clone(),
                Arc::new(Bucket::new(name, bucket_record.created_at, index)),
            );
        }

        *self.buckets.write() = loaded;
        info!(
            buckets = report.buckets,
            objects = report.objects,
            superseded = report.superseded,
            orphans = report.orphans,
            "registry loaded"
        );
        Ok(report)
    }

    /// Create an empty bucket.
    pub async fn create_bucket(&self, name: &str) -> Result<Arc<Bucket>, S3Error> {
        validate_bucket_name(name)?;
        {
            let buckets = self.buckets.read();
            let mut reserved = self.reserved.lock();
            if buckets.contains_key(name) || !reserved.insert(name.to_string()) {
                return Err(S3Error::AlreadyExists {
                    bucket: name.to_string(),
                });
            }
        }
        let _reservation = Reservation {
            registry: self,
            name,
        };

        self.storage.create_bucket(name).await?;
        let record = BucketRecord {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.metadata.put_bucket(&record).await {
            if let Err(cleanup) = self.storage.delete_bucket(name).await {
                warn!(bucket = %name, "failed to remove storage after create error: {cleanup}");
            }
            return Err(err.into());
        }

        let bucket = Arc::new(Bucket::new(
            record.name,
            record.created_at,
            KeyIndex::default(),
        ));
        self.buckets
            .write()
            .insert(name.to_string(), Arc::clone(&bucket));
        info!(bucket = %name, "bucket created");
        Ok(bucket)
    }

    /// Delete an empty bucket.
    ///
    /// Fails with `NotEmpty` while the bucket holds objects or has any
    /// registered write, including open multipart uploads.
    pub async fn delete_bucket(&self, name: &str) -> Result<(), S3Error> {
        let bucket = self.get(name)?;
        let mut live = bucket.lifecycle.write().await;
        if !*live {
            return Err(S3Error::NoSuchBucket {
                bucket: name.to_string(),
            });
        }
        if !bucket.index.is_empty() || bucket.in_flight() > 0 {
            return Err(S3Error::NotEmpty {
                bucket: name.to_string(),
            });
        }

        // Once the record is gone the bucket will not come back on restart.
        self.metadata.delete_bucket(name).await?;
        *live = false;
        {
            let mut buckets = self.buckets.write();
            if buckets.get(name).is_some_and(|b| Arc::ptr_eq(b, &bucket)) {
                buckets.remove(name);
            }
        }
        drop(live);

        if let Err(err) = self.storage.delete_bucket(name).await {
            warn!(bucket = %name, "bucket storage left behind: {err}");
        }
        info!(bucket = %name, "bucket deleted");
        Ok(())
    }

    /// Look up a live bucket.
    pub fn get(&self, name: &str) -> Result<Arc<Bucket>, S3Error> {
        self.buckets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| S3Error::NoSuchBucket {
                bucket: name.to_string(),
            })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.buckets.read().contains_key(name)
    }

    /// All live buckets, sorted by name.
    pub fn list(&self) -> Vec<Arc<Bucket>> {
        let mut buckets: Vec<Arc<Bucket>> = self.buckets.read().values().cloned().collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}
