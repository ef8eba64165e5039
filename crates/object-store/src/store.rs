use std::fmt::Debug;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// A single entry returned by [`Store::read_dir`] or [`Store::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Last path segment
    pub name: String,
    /// Whether the entry is a directory (a common prefix)
    pub is_dir: bool,
    /// Size in bytes, zero for directories
    pub size: u64,
    /// Last modification time, unknown for directories
    pub modified: Option<DateTime<Utc>>,
}

/// Storage backend consumed by the vault.
///
/// Paths are POSIX-style, slash separated and relative to the root of the
/// backend. Implementations must be safe to share across tasks.
#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// Stable identifier of the backend, used to derive vault ids.
    fn id(&self) -> &str;

    /// List the direct children of `dir`. A missing directory is empty.
    async fn read_dir(&self, dir: &str) -> Result<Vec<Entry>>;

    /// Read the object at `path`, optionally restricted to a byte range.
    async fn read(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes>;

    /// Write the object at `path`, replacing any previous content.
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    /// Write the object at `path` only if nothing is stored there yet.
    ///
    /// Returns `false` when the object already existed. Backends with a
    /// native conditional put override this; the default is a stat followed
    /// by a write and is therefore only as strong as the backend's
    /// consistency.
    async fn create(&self, path: &str, data: Bytes) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => {
                self.write(path, data).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Metadata of the object at `path`.
    async fn stat(&self, path: &str) -> Result<Entry>;

    /// Delete the object at `path`, or everything below it when `path` is a
    /// directory. Deleting something that does not exist is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
