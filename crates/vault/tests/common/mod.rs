//! Shared test utilities for vault integration tests
#![allow(dead_code)]

use std::sync::Arc;

use store::{ObjectStorage, Store};
use tempfile::TempDir;
use vault::prelude::*;

/// A store shared by every instance of a test, and scratch space for
/// staging dirs and local copies
pub struct TestEnv {
    pub store: Arc<dyn Store>,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            store: Arc::new(ObjectStorage::memory()),
            dir: TempDir::new().unwrap(),
        }
    }

    /// A builder for one instance with its own metadata cache. Housekeeping
    /// is off so tests decide when background work happens.
    pub async fn builder(&self, realm: Realm, identity: &SecretKey) -> VaultBuilder {
        let db = Database::in_memory().await.unwrap();
        let staging = self
            .dir
            .path()
            .join("staging")
            .join(uuid::Uuid::new_v4().to_string());
        Vault::builder(realm, identity.clone(), self.store.clone(), db)
            .staging_dir(staging)
            .housekeeping(false)
    }

    pub async fn create(&self, realm: Realm, identity: &SecretKey) -> Vault {
        self.builder(realm, identity).await.create().await.unwrap()
    }

    pub async fn open(&self, realm: Realm, identity: &SecretKey) -> Vault {
        self.builder(realm, identity).await.open().await.unwrap()
    }
}

/// Install a log subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
