use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use store::Store;
use tokio::sync::{broadcast, Notify, Semaphore};
use uuid::Uuid;

use super::{LastRuns, Vault, VaultInner};
use crate::config::Config;
use crate::crypto::SecretKey;
use crate::database::Database;
use crate::error::{Result, VaultError};
use crate::ledger::{Change, Ledger, CONFIG_SETTING};
use crate::model::{Access, Realm};
use crate::registry::VaultRegistry;
use crate::relay::{ChangeNotifier, WebSocketRelay};

const EVENT_CAPACITY: usize = 256;

/// Opens or creates a [`Vault`]
pub struct VaultBuilder {
    realm: Realm,
    identity: SecretKey,
    store: Arc<dyn Store>,
    db: Database,
    config: Config,
    staging_dir: Option<PathBuf>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    registry: Option<VaultRegistry>,
    housekeeping: bool,
}

impl VaultBuilder {
    pub fn new(realm: Realm, identity: SecretKey, store: Arc<dyn Store>, db: Database) -> Self {
        VaultBuilder {
            realm,
            identity,
            store,
            db,
            config: Config::default(),
            staging_dir: None,
            notifier: None,
            registry: None,
            housekeeping: true,
        }
    }

    /// Configuration written to the ledger on create, and used on open
    /// until the ledger supplies one.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Where deferred writes keep their encoded objects until uploaded.
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Change notifier to use instead of connecting to `sync_relay`.
    pub fn notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(mut self, registry: VaultRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run the periodic housekeeping task (on by default).
    pub fn housekeeping(mut self, enabled: bool) -> Self {
        self.housekeeping = enabled;
        self
    }

    /// Create a new vault, wiping whatever the realm held in the store.
    ///
    /// The caller becomes the vault's author with full access.
    pub async fn create(self) -> Result<Vault> {
        self.config.validate()?;
        let config = self.config.clone().normalized();
        let realm = self.realm.clone();
        self.store.delete(realm.as_str()).await?;
        let id = vault_id(&realm, self.store.as_ref());
        self.db.reset_vault(&id).await?;

        let housekeeping = self.housekeeping;
        let vault = self.build(config.clone()).await?;
        let me = vault.public_key();

        let mut changes = vec![Change::Config(config.clone())];
        changes.extend(vault.access_changes(&[(me, Access::READ_WRITE_ADMIN)]).await?);
        vault.inner.ledger.stage(&changes).await?;
        vault
            .inner
            .ledger
            .sync(config.ledger_sync_attempts)
            .await?;

        tracing::info!(vault = %vault.id(), author = %me, "created vault");
        vault.start(housekeeping).await?;
        Ok(vault)
    }

    /// Open an existing vault. The caller must already hold access.
    pub async fn open(self) -> Result<Vault> {
        self.config.validate()?;
        let housekeeping = self.housekeeping;
        let fallback = self.config.clone().normalized();
        let vault = self.build(fallback).await?;

        let attempts = vault.config().ledger_sync_attempts;
        vault.inner.ledger.sync(attempts).await?;
        vault.load_config().await?;

        let me = vault.public_key();
        if !vault.has_access(&me).await? {
            return Err(VaultError::Unauthorized(format!(
                "{} has no access to {}",
                me,
                vault.id()
            )));
        }
        vault.recompute_allocated().await?;

        tracing::info!(vault = %vault.id(), user = %me, "opened vault");
        vault.start(housekeeping).await?;
        vault.sync().await?;
        Ok(vault)
    }

    async fn build(self, config: Config) -> Result<Vault> {
        let id = vault_id(&self.realm, self.store.as_ref());
        let instance_id = Uuid::new_v4().to_string();

        let notifier = match (self.notifier, &config.sync_relay) {
            (Some(notifier), _) => Some(notifier),
            (None, Some(url)) => {
                Some(Arc::new(WebSocketRelay::connect(url).await?) as Arc<dyn ChangeNotifier>)
            }
            (None, None) => None,
        };

        let staging_dir = self.staging_dir.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("bao-vault")
                .join(instance_id.as_str())
        });

        let ledger = Ledger::new(
            self.store.clone(),
            self.db.clone(),
            id.clone(),
            self.realm.clone(),
            self.identity.clone(),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let now = Instant::now();

        let inner = VaultInner {
            id,
            instance_id,
            realm: self.realm,
            identity: self.identity,
            store: self.store,
            db: self.db,
            io_throttle: Semaphore::new(config.io_throttle),
            config: RwLock::new(config),
            ledger,
            allocated: Mutex::new(0),
            signals: Mutex::new(HashMap::new()),
            writers: AtomicUsize::new(0),
            rescan: AtomicBool::new(false),
            staging_dir,
            last_runs: Mutex::new(LastRuns {
                ledger_sync: now,
                files_sync: None,
                sweep: now,
                cleanup: now,
            }),
            files_sync_lock: tokio::sync::Mutex::new(()),
            new_files: Notify::new(),
            events,
            tasks: Mutex::new(Vec::new()),
            notifier,
            registry: self.registry,
            closed: AtomicBool::new(false),
        };
        Ok(Vault {
            inner: Arc::new(inner),
        })
    }
}

fn vault_id(realm: &Realm, store: &dyn Store) -> String {
    format!("{}@{}", realm, store.id())
}

impl Vault {
    /// Background tasks and registration shared by create and open.
    async fn start(&self, housekeeping: bool) -> Result<()> {
        if housekeeping {
            let task = self.spawn_housekeeping();
            self.inner.tasks.lock().push(task);
        }
        if let Some(notifier) = &self.inner.notifier {
            let rx = notifier.subscribe(self.inner.realm.as_str()).await?;
            let task = self.spawn_listener(rx);
            self.inner.tasks.lock().push(task);
        }
        if let Some(registry) = &self.inner.registry {
            registry.register(&self.inner.instance_id, &self.inner.id);
        }
        Ok(())
    }

    /// Replace the local configuration with the one recorded in the ledger.
    pub(super) async fn load_config(&self) -> Result<()> {
        let Some(data) = self.inner.db.setting(&self.inner.id, CONFIG_SETTING).await? else {
            return Ok(());
        };
        let config: Config = bincode::deserialize(&data).map_err(crate::ledger::LedgerError::from)?;
        let config = config.normalized();
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Stop background work and deregister. Pending deferred operations
    /// stay in the cache for the next open.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Some(notifier) = &self.inner.notifier {
            if let Err(e) = notifier.unsubscribe(self.inner.realm.as_str()).await {
                tracing::warn!(vault = %self.inner.id, error = %e, "relay unsubscribe failed");
            }
        }
        if let Some(registry) = &self.inner.registry {
            registry.deregister(&self.inner.instance_id);
        }
        tracing::info!(vault = %self.inner.id, "closed vault");
        Ok(())
    }
}
