//! Error types for vault operations.

use crate::codec::CodecError;
use crate::crypto::{KeyError, SecretError, SecretShareError};
use crate::ledger::LedgerError;

/// Errors returned by the public vault API.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Caller lacks the rights for the operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Signature, hash chain or wire format check failed
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Unknown file, version or object
    #[error("not found: {0}")]
    NotFound(String),

    /// Write would exceed the configured max storage
    #[error("storage capacity exceeded: {needed} bytes needed, {max} allowed")]
    Capacity { needed: u64, max: u64 },

    /// Unsupported or malformed configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Concurrent writers kept winning the race for the next block
    #[error("ledger did not settle after {0} attempts")]
    LedgerContention(usize),

    /// Object store call failed
    #[error("store error: {0}")]
    Store(#[from] store::BlobStoreError),

    /// Metadata cache call failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Metadata cache migration failed
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("share error: {0}")]
    Share(#[from] SecretShareError),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl VaultError {
    /// Whether the error means the requested file or object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            VaultError::NotFound(_) => true,
            VaultError::Store(e) => e.is_not_found(),
            VaultError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VaultError::Store(e) => !e.is_not_found(),
            VaultError::Database(_) | VaultError::Io(_) | VaultError::LedgerContention(_) => true,
            _ => false,
        }
    }

    /// Whether the error is a failed integrity check on stored data.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            VaultError::Integrity(_) | VaultError::Ledger(_) | VaultError::Codec(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
