//! Object storage backends for the vault
//!
//! This crate exposes a single async [`Store`] trait covering what the vault
//! needs from a storage backend: hierarchical listing, ranged reads, whole-file
//! writes, create-if-absent writes, stat and delete. The bundled
//! [`ObjectStorage`] implementation is backed by the `object_store` crate and
//! supports in-memory, local filesystem and S3-compatible storage.
//!
//! # Example
//!
//! ```rust,no_run
//! use store::{ObjectStorage, ObjectStoreConfig, Store};
//!
//! # async fn example() -> Result<(), store::BlobStoreError> {
//! let storage = ObjectStorage::new(ObjectStoreConfig::Local {
//!     path: "/tmp/vault".into(),
//! })
//! .await?;
//!
//! storage.write("users/data/.change", Vec::new().into()).await?;
//! let entries = storage.read_dir("users/data").await?;
//! # let _ = entries;
//! # Ok(())
//! # }
//! ```

mod error;
mod storage;
mod store;

pub use error::{BlobStoreError, Result};
pub use storage::{ObjectStorage, ObjectStoreConfig};
pub use store::{Entry, Store};
