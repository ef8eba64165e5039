//! Object storage backend abstraction (S3/MinIO/local filesystem/memory).

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutMode};
use serde::{Deserialize, Serialize};

use crate::error::{BlobStoreError, Result};
use crate::store::{Entry, Store};

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage
    Local {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

/// [`Store`] implementation over the `object_store` crate.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    inner: Arc<dyn ObjectStore>,
    id: String,
}

impl ObjectStorage {
    /// Create a new storage backend from configuration.
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        let (inner, id): (Arc<dyn ObjectStore>, String) = match &config {
            ObjectStoreConfig::Memory => (Arc::new(InMemory::new()), "memory".to_string()),

            ObjectStoreConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .map_err(|e| BlobStoreError::InvalidConfig(e.to_string()))?;
                (Arc::new(store), format!("file://{}", path.display()))
            }

            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| BlobStoreError::InvalidConfig(e.to_string()))?,
                );

                // fail fast when the bucket is missing
                let mut stream = store.list(None);
                match stream.try_next().await {
                    Ok(_) => {}
                    Err(object_store::Error::NotFound { .. }) => {
                        return Err(BlobStoreError::BucketNotFound(bucket.clone()));
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("NoSuchBucket") {
                            return Err(BlobStoreError::BucketNotFound(bucket.clone()));
                        }
                        return Err(e.into());
                    }
                }
                drop(stream);

                (store, format!("s3://{}", bucket))
            }
        };

        tracing::debug!(store = %id, "opened object storage");
        Ok(Self { inner, id })
    }

    /// Create an in-memory storage backend.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            id: "memory".to_string(),
        }
    }

    fn object_path(path: &str) -> ObjectPath {
        ObjectPath::from(path.trim_matches('/'))
    }

    fn not_found(path: &str, err: object_store::Error) -> BlobStoreError {
        match err {
            object_store::Error::NotFound { .. } => BlobStoreError::NotFound(path.to_string()),
            e => e.into(),
        }
    }

    fn file_entry(meta: &ObjectMeta) -> Entry {
        Entry {
            name: meta.location.filename().unwrap_or_default().to_string(),
            is_dir: false,
            size: meta.size as u64,
            modified: Some(meta.last_modified),
        }
    }
}

#[async_trait]
impl Store for ObjectStorage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_dir(&self, dir: &str) -> Result<Vec<Entry>> {
        let prefix = Self::object_path(dir);
        let prefix = if prefix.as_ref().is_empty() {
            None
        } else {
            Some(&prefix)
        };

        let listing = match self.inner.list_with_delimiter(prefix).await {
            Ok(listing) => listing,
            Err(object_store::Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<Entry> = listing
            .common_prefixes
            .iter()
            .map(|p| Entry {
                name: p.filename().unwrap_or_default().to_string(),
                is_dir: true,
                size: 0,
                modified: None,
            })
            .collect();
        entries.extend(listing.objects.iter().map(Self::file_entry));
        Ok(entries)
    }

    async fn read(&self, path: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        let location = Self::object_path(path);
        match range {
            Some(range) => {
                let range = range.start as usize..range.end as usize;
                self.inner
                    .get_range(&location, range)
                    .await
                    .map_err(|e| Self::not_found(path, e))
            }
            None => {
                let result = self
                    .inner
                    .get(&location)
                    .await
                    .map_err(|e| Self::not_found(path, e))?;
                Ok(result.bytes().await?)
            }
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let location = Self::object_path(path);
        self.inner.put(&location, data.into()).await?;
        Ok(())
    }

    async fn create(&self, path: &str, data: Bytes) -> Result<bool> {
        let location = Self::object_path(path);
        match self
            .inner
            .put_opts(&location, data.clone().into(), PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            // S3 without conditional put support
            Err(object_store::Error::NotImplemented) => match self.stat(path).await {
                Ok(_) => Ok(false),
                Err(e) if e.is_not_found() => {
                    self.write(path, data).await?;
                    Ok(true)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let location = Self::object_path(path);
        match self.inner.head(&location).await {
            Ok(meta) => Ok(Self::file_entry(&meta)),
            Err(object_store::Error::NotFound { .. }) => {
                // directories only exist as prefixes of other objects
                let listing = self.inner.list_with_delimiter(Some(&location)).await;
                match listing {
                    Ok(l) if !l.objects.is_empty() || !l.common_prefixes.is_empty() => Ok(Entry {
                        name: location.filename().unwrap_or_default().to_string(),
                        is_dir: true,
                        size: 0,
                        modified: None,
                    }),
                    _ => Err(BlobStoreError::NotFound(path.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = Self::object_path(path);
        match self.inner.head(&location).await {
            Ok(_) => match self.inner.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Err(object_store::Error::NotFound { .. }) => {
                let objects: Vec<ObjectMeta> = match self.inner.list(Some(&location)).try_collect().await
                {
                    Ok(objects) => objects,
                    Err(object_store::Error::NotFound { .. }) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                for meta in objects {
                    match self.inner.delete(&meta.location).await {
                        Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = ObjectStorage::memory();
        let data = Bytes::from("hello world");

        storage.write("realm/data/a", data.clone()).await.unwrap();
        let retrieved = storage.read("realm/data/a", None).await.unwrap();
        assert_eq!(retrieved, data);

        let partial = storage.read("realm/data/a", Some(6..11)).await.unwrap();
        assert_eq!(partial, Bytes::from("world"));

        let entry = storage.stat("realm/data/a").await.unwrap();
        assert_eq!(entry.size, 11);
        assert!(!entry.is_dir);
        assert!(entry.modified.is_some());

        storage.delete("realm/data/a").await.unwrap();
        let err = storage.read("realm/data/a", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_dir_lists_files_and_dirs() {
        let storage = ObjectStorage::memory();
        storage.write("r/data/20250101000000/h/x", Bytes::from("1")).await.unwrap();
        storage.write("r/data/20250102000000/h/y", Bytes::from("2")).await.unwrap();
        storage.write("r/data/.change", Bytes::new()).await.unwrap();

        let mut entries = storage.read_dir("r/data").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_dir)).collect();
        assert_eq!(
            names,
            vec![
                (".change", false),
                ("20250101000000", true),
                ("20250102000000", true)
            ]
        );

        assert!(storage.read_dir("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_only_once() {
        let storage = ObjectStorage::memory();
        assert!(storage.create("r/blockchain/AAAA", Bytes::from("a")).await.unwrap());
        assert!(!storage.create("r/blockchain/AAAA", Bytes::from("b")).await.unwrap());

        let data = storage.read("r/blockchain/AAAA", None).await.unwrap();
        assert_eq!(data, Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let storage = ObjectStorage::memory();
        storage.write("r/data/d1/h/a", Bytes::from("1")).await.unwrap();
        storage.write("r/data/d1/b/a", Bytes::from("1")).await.unwrap();
        storage.write("r/data/d2/h/b", Bytes::from("1")).await.unwrap();

        storage.delete("r/data/d1").await.unwrap();
        let entries = storage.read_dir("r/data").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "d2");

        // deleting twice is fine
        storage.delete("r/data/d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig::Local {
            path: temp_dir.path().to_path_buf(),
        };

        let storage = ObjectStorage::new(config).await.unwrap();
        assert!(storage.id().starts_with("file://"));

        let data = Bytes::from("test data");
        storage.write("realm/data/x", data.clone()).await.unwrap();
        let retrieved = storage.read("realm/data/x", None).await.unwrap();
        assert_eq!(retrieved, data);

        let file_path = temp_dir.path().join("realm").join("data").join("x");
        assert!(file_path.exists());

        let dir = storage.stat("realm/data").await.unwrap();
        assert!(dir.is_dir);
    }
}
