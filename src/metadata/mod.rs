//! Object metadata: persisted records and the in-memory key index.
//!
//! The [`store::MetadataStore`] trait abstracts over where records are
//! persisted.  Implementations are JSON sidecar files next to the data
//! and a process-local in-memory store.

pub mod index;
pub mod memory;
pub mod sidecar;
pub mod store;
