//! Encrypted multi-writer vaults over plain object storage
//!
//! A vault lets a group of users share files through a storage backend they
//! do not trust (S3, a shared folder, memory in tests). Nothing runs next to
//! the store: every instance reads and writes objects and keeps a private
//! SQLite cache of what it has learned.
//!
//! - The **ledger** is a signed, hash-chained log of administrative changes
//!   (configuration, access grants, group keys, user attributes). Writers
//!   race for the next block with a create-if-absent write and retry on
//!   conflict.
//! - **Access and keys**: the group key is shared with each member through
//!   the ledger and rotated whenever someone loses access.
//! - Every **file** version is a signed header plus an encrypted body,
//!   written once and never modified. Readers discover new versions by
//!   listing time bucketed directories.
//!
//! Three realms cover the usual sharing patterns: `all` (plain, signed),
//! `home` (sealed to one recipient, named by the first path segment) and
//! any other name (encrypted for the group).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use store::ObjectStorage;
//! use vault::prelude::*;
//!
//! # async fn example() -> vault::Result<()> {
//! let store = Arc::new(ObjectStorage::memory());
//! let db = Database::in_memory().await?;
//! let vault = Vault::builder(Realm::users(), SecretKey::generate(), store, db)
//!     .create()
//!     .await?;
//! vault.write("docs/hello.txt", "hello", &[], IoMode::Sync).await?;
//! assert_eq!(vault.read("docs/hello.txt").await?, "hello");
//! # Ok(())
//! # }
//! ```

/**
 * File headers and bodies as written to the store.
 */
pub mod codec;
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Public and private key implementations
 *  - Key-to-key key sharing
 *  - Symmetric encryption of headers and bodies
 */
pub mod crypto;
/**
 * Local metadata cache.
 */
pub mod database;
pub mod error;
/**
 * Signed hash-chained log of administrative changes.
 */
pub mod ledger;
pub mod model;
pub mod registry;
pub mod relay;
mod vault;

pub use error::{Result, VaultError};
pub use vault::{node_hash, IoMode, SyncReport, Vault, VaultBuilder, VaultEvent};

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::database::Database;
    pub use crate::error::{Result, VaultError};
    pub use crate::model::{Access, File, FileId, Flags, Realm};
    pub use crate::registry::VaultRegistry;
    pub use crate::relay::{ChangeNotifier, LocalRelay, Notification, WebSocketRelay};
    pub use crate::vault::{IoMode, SyncReport, Vault, VaultBuilder, VaultEvent};
}
