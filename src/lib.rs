//! S3Dir library: an S3-compatible object store backed by a directory.
//!
//! The storage core ([`registry`], [`store`], [`listing`], [`uploads`])
//! sits on two trait seams, [`storage::backend::StorageBackend`] for blob
//! bytes and [`metadata::store::MetadataStore`] for records; [`server`]
//! puts the S3 HTTP surface on top.

use std::sync::Arc;

pub mod auth;
pub mod chunked;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod listing;
pub mod metadata;
pub mod metrics;
pub mod presign;
pub mod registry;
pub mod server;
pub mod storage;
pub mod store;
pub mod uploads;
pub mod xml;

use crate::auth::Credentials;
use crate::config::Config;
use crate::metadata::memory::MemoryMetadataStore;
use crate::metadata::store::MetadataStore;
use crate::presign::PresignSigner;
use crate::registry::BucketRegistry;
use crate::storage::backend::StorageBackend;
use crate::storage::memory::MemoryBackend;
use crate::store::ObjectStore;
use crate::uploads::UploadAssembler;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<BucketRegistry>,
    pub store: Arc<ObjectStore>,
    pub uploads: Arc<UploadAssembler>,
    /// Issues and checks presigned grants.
    pub signer: PresignSigner,
    /// Set when SigV4 verification is enabled.
    pub credentials: Option<Credentials>,
}

impl AppState {
    /// Wire the storage core over the given backends.
    ///
    /// Does not load persisted state; call [`BucketRegistry::load`] on
    /// `registry` before serving.
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let registry = Arc::new(BucketRegistry::new(storage.clone(), metadata.clone()));
        let store = Arc::new(ObjectStore::new(
            registry.clone(),
            storage.clone(),
            metadata,
        ));
        let uploads = Arc::new(UploadAssembler::new(
            registry.clone(),
            storage,
            store.clone(),
        ));
        let signer = match config.presign_secret() {
            Some(secret) => PresignSigner::new(secret),
            None => {
                tracing::warn!(
                    "no presign secret configured; presigned URLs will not survive a restart"
                );
                PresignSigner::random()
            }
        };
        let credentials = config.auth.enabled.then(|| Credentials {
            access_key: config.auth.access_key.clone(),
            secret_key: config.auth.secret_key.clone(),
        });
        Self {
            config,
            registry,
            store,
            uploads,
            signer,
            credentials,
        }
    }

    /// State over in-memory backends.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryMetadataStore::new()),
        )
    }
}
