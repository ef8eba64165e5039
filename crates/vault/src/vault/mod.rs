//! The vault engine
//!
//! A [`Vault`] binds one realm of one store to a local identity and a
//! private metadata cache. It is a cheap handle: clones share the same
//! state, background tasks and I/O throttle.
//!
//! Mutating operations take an [`IoMode`]:
//!
//! - [`IoMode::Sync`] returns once the change is durable in the store
//! - [`IoMode::Async`] returns at once; completion is reported through
//!   [`Vault::wait_files`] and [`Vault::subscribe`]
//! - [`IoMode::Deferred`] only records the intent; the next housekeeping
//!   sweep completes it, batching many small changes together

mod access;
mod builder;
mod housekeeping;
mod io;
mod names;
mod read;
mod sync;
mod write;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use store::Store;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crypto::{PublicKey, SecretKey};
use crate::database::Database;
use crate::error::{Result, VaultError};
use crate::ledger::Ledger;
use crate::model::{FileId, Realm};
use crate::registry::VaultRegistry;
use crate::relay::ChangeNotifier;

pub use builder::VaultBuilder;
pub use names::node_hash;
pub use sync::SyncReport;

/// How a mutating operation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Block until the change is in the store
    #[default]
    Sync,
    /// Start the transfer in the background
    Async,
    /// Leave the change pending for the next housekeeping sweep
    Deferred,
}

/// Outcome of background work, observable through [`Vault::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    /// A background read or write finished
    IoCompleted(FileId),
    /// A background read or write failed and was rolled back
    IoFailed { id: FileId, error: String },
    /// Synchronization discovered files written elsewhere
    NewFiles(usize),
    /// A background ledger export failed
    LedgerFailed(String),
    /// A housekeeping step failed
    HousekeepingFailed(String),
}

/// When each housekeeping cadence last ran
#[derive(Debug)]
struct LastRuns {
    ledger_sync: Instant,
    files_sync: Option<Instant>,
    sweep: Instant,
    cleanup: Instant,
}

#[derive(Debug)]
pub(crate) struct VaultInner {
    /// `<realm>@<store id>`
    id: String,
    /// Distinguishes this process's notifications from other writers'
    instance_id: String,
    realm: Realm,
    identity: SecretKey,
    store: Arc<dyn Store>,
    db: Database,
    config: RwLock<Config>,
    ledger: Ledger,
    /// Bytes used in the store; recomputed from the cache after sweeps
    allocated: Mutex<u64>,
    io_throttle: Semaphore,
    /// Completion signal of every in-flight background transfer
    signals: Mutex<HashMap<FileId, watch::Sender<bool>>>,
    /// Uploads in flight; the last one out touches the change sentinel
    writers: AtomicUsize,
    /// New keys arrived, so headers skipped earlier may now be readable
    rescan: AtomicBool,
    staging_dir: PathBuf,
    last_runs: Mutex<LastRuns>,
    files_sync_lock: tokio::sync::Mutex<()>,
    new_files: Notify,
    events: broadcast::Sender<VaultEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    registry: Option<VaultRegistry>,
    closed: AtomicBool,
}

/// An open vault
#[derive(Debug, Clone)]
pub struct Vault {
    inner: Arc<VaultInner>,
}

impl Vault {
    pub fn builder(
        realm: Realm,
        identity: SecretKey,
        store: Arc<dyn Store>,
        db: Database,
    ) -> VaultBuilder {
        VaultBuilder::new(realm, identity, store, db)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn realm(&self) -> &Realm {
        &self.inner.realm
    }

    pub fn identity(&self) -> &SecretKey {
        &self.inner.identity
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.identity.public()
    }

    /// Current configuration, as last set through the ledger.
    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Creator of the vault.
    pub async fn author(&self) -> Result<PublicKey> {
        self.inner
            .ledger
            .owner()
            .await?
            .ok_or_else(|| VaultError::Integrity("vault has no author".into()))
    }

    /// Bytes currently used in the store by this vault.
    pub fn allocated_size(&self) -> u64 {
        *self.inner.allocated.lock()
    }

    /// Number of blocks applied from the ledger.
    pub async fn ledger_height(&self) -> Result<u64> {
        self.inner.db.block_count(&self.inner.id).await
    }

    /// Content hash of the last applied block, `None` before the first one.
    pub async fn ledger_tip(&self) -> Result<Option<Vec<u8>>> {
        self.inner.db.last_block_hash(&self.inner.id).await
    }

    /// Observe background completions and failures.
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    fn emit(&self, event: VaultEvent) {
        // nobody listening is fine
        let _ = self.inner.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(VaultError::Config(format!("vault {} is closed", self.inner.id)));
        }
        Ok(())
    }
}
