//! Error types for the storage backends.

/// Errors that can occur when working with a store.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Object storage error
    #[error("object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object or directory not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Path could not be mapped onto the backend
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// S3 bucket not found - must be created before use
    #[error("S3 bucket '{0}' does not exist. Create it before opening a vault on it.")]
    BucketNotFound(String),
}

impl BlobStoreError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobStoreError::NotFound(_)
                | BlobStoreError::ObjectStore(object_store::Error::NotFound { .. })
        ) || matches!(self, BlobStoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, BlobStoreError>;
