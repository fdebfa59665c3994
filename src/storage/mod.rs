//! Object storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live: a directory tree on local disk, or process memory.

pub mod backend;
pub mod local;
pub mod memory;
