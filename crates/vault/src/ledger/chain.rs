use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use store::Store;

use super::block::{block_name, content_hash, decode_block, encode_block, Block, GENESIS_HASH};
use super::change::{ApplyContext, Change};
use super::LedgerError;
use crate::crypto::{PublicKey, SecretKey};
use crate::database::{BlockRecord, Database};
use crate::error::{Result, VaultError};
use crate::model::Realm;

/// Extra reads after an export before the block is trusted to be visible
const READ_BACK_RETRIES: usize = 3;
const READ_BACK_DELAY: Duration = Duration::from_millis(100);

/// Settings key holding the creator of the vault
const OWNER_SETTING: &str = "owner";

/// Result of one export attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Nothing staged, or the block is in the store and applied
    Done,
    /// Another writer took the slot; import and try again
    Retry,
}

/// The hash chained ledger of one vault
///
/// Import and export hold a local lock, so two tasks of the same process
/// never race for the next block. Processes race through the store and
/// settle through [`Ledger::sync`].
#[derive(Debug)]
pub(crate) struct Ledger {
    store: Arc<dyn Store>,
    db: Database,
    vault: String,
    realm: Realm,
    identity: SecretKey,
    lock: tokio::sync::Mutex<()>,
}

impl Ledger {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        db: Database,
        vault: String,
        realm: Realm,
        identity: SecretKey,
    ) -> Self {
        Self {
            store,
            db,
            vault,
            realm,
            identity,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn block_path(&self, parent_hash: &[u8]) -> String {
        format!("{}/{}", self.realm.ledger_dir(), block_name(parent_hash))
    }

    /// Creator of the vault, known once the first block is applied.
    pub(crate) async fn owner(&self) -> Result<Option<PublicKey>> {
        match self.db.setting(&self.vault, OWNER_SETTING).await? {
            Some(bytes) => Ok(Some(PublicKey::try_from(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    async fn tip(&self) -> Result<Vec<u8>> {
        Ok(self
            .db
            .last_block_hash(&self.vault)
            .await?
            .unwrap_or_else(|| GENESIS_HASH.to_vec()))
    }

    async fn apply_block(&self, block: &Block) -> Result<()> {
        if block.parent_hash == GENESIS_HASH {
            self.db
                .set_setting(&self.vault, OWNER_SETTING, &block.author.to_bytes())
                .await?;
        }
        self.db.register_identity(&block.author).await?;
        let owner = self
            .owner()
            .await?
            .ok_or_else(|| VaultError::Integrity("ledger has no first block".into()))?;

        let ctx = ApplyContext {
            db: &self.db,
            vault: &self.vault,
            identity: &self.identity,
            owner: &owner,
        };
        for change in &block.changes {
            match Change::decode(change)? {
                Some(change) => change.apply(&ctx, &block.author).await?,
                None => tracing::warn!(
                    vault = %self.vault,
                    kind = change.kind,
                    block = block.id,
                    "skipping unknown change type"
                ),
            }
        }
        Ok(())
    }

    async fn record_block(&self, name: String, hash: Vec<u8>, block: &Block) -> Result<()> {
        let record = BlockRecord {
            name,
            hash,
            block_id: block.id,
            author: block.author,
            timestamp: block.timestamp,
        };
        self.db.insert_block(&self.vault, &record).await
    }

    async fn import_locked(&self) -> Result<usize> {
        let mut cursor = self.tip().await?;
        let mut imported = 0;
        loop {
            let name = block_name(&cursor);
            let path = self.block_path(&cursor);
            let data = match self.store.read(&path, None).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e.into()),
            };

            let block = decode_block(&data)?;
            if block.parent_hash != cursor {
                return Err(LedgerError::Chain(format!(
                    "block {} does not chain to its name",
                    name
                ))
                .into());
            }

            self.apply_block(&block).await?;
            let hash = content_hash(&data);
            self.record_block(name, hash.clone(), &block).await?;
            tracing::debug!(vault = %self.vault, block = block.id, author = %block.author, "imported block");

            cursor = hash;
            imported += 1;
        }
        Ok(imported)
    }

    async fn export_locked(&self) -> Result<ExportOutcome> {
        let staged = self.db.staged_changes(&self.vault).await?;
        let Some((last_id, _)) = staged.last() else {
            return Ok(ExportOutcome::Done);
        };
        let last_id = *last_id;

        let parent = self.tip().await?;
        let changes = staged.into_iter().map(|(_, change)| change).collect();
        let mut block = Block::new(self.identity.public(), parent.clone(), changes);
        let data = Bytes::from(encode_block(&self.identity, &mut block)?);

        let path = self.block_path(&parent);
        if !self.store.create(&path, data.clone()).await? {
            tracing::debug!(vault = %self.vault, "ledger slot taken, retrying");
            return Ok(ExportOutcome::Retry);
        }

        let mut visible = false;
        for attempt in 0..=READ_BACK_RETRIES {
            match self.store.read(&path, None).await {
                Ok(stored) if stored == data => {
                    visible = true;
                    break;
                }
                Ok(_) => {
                    tracing::warn!(vault = %self.vault, attempt, "exported block was overwritten");
                    return Ok(ExportOutcome::Retry);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(READ_BACK_DELAY).await;
        }
        if !visible {
            return Ok(ExportOutcome::Retry);
        }

        self.apply_block(&block).await?;
        self.record_block(block_name(&parent), content_hash(&data), &block)
            .await?;
        self.db.clear_staged(&self.vault, last_id).await?;
        tracing::info!(
            vault = %self.vault,
            block = block.id,
            changes = block.changes.len(),
            "exported block"
        );
        Ok(ExportOutcome::Done)
    }

    /// Apply every block written since the last import.
    #[cfg(test)]
    pub(crate) async fn import(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        self.import_locked().await
    }

    /// Write staged changes as the next block.
    #[cfg(test)]
    pub(crate) async fn export(&self) -> Result<ExportOutcome> {
        let _guard = self.lock.lock().await;
        self.export_locked().await
    }

    /// Import then export until the staged changes are in the chain.
    ///
    /// Returns whether a block was exported.
    pub(crate) async fn sync(&self, max_attempts: usize) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let exporting = !self.db.staged_changes(&self.vault).await?.is_empty();
        for attempt in 1..=max_attempts {
            self.import_locked().await?;
            match self.export_locked().await? {
                ExportOutcome::Done => return Ok(exporting),
                ExportOutcome::Retry => {
                    tracing::debug!(vault = %self.vault, attempt, "ledger export contended")
                }
            }
        }
        Err(VaultError::LedgerContention(max_attempts))
    }

    pub(crate) async fn stage(&self, changes: &[Change]) -> Result<()> {
        for change in changes {
            self.db.stage_change(&self.vault, &change.encode()?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::change::{AddAttribute, ChangeAccess};
    use crate::model::Access;
    use async_trait::async_trait;
    use std::ops::Range;
    use store::{Entry, ObjectStorage};

    /// A store where every ledger slot is already taken
    #[derive(Debug)]
    struct Crowded(ObjectStorage);

    #[async_trait]
    impl Store for Crowded {
        fn id(&self) -> &str {
            self.0.id()
        }
        async fn read_dir(&self, dir: &str) -> store::Result<Vec<Entry>> {
            self.0.read_dir(dir).await
        }
        async fn read(&self, path: &str, range: Option<Range<u64>>) -> store::Result<Bytes> {
            self.0.read(path, range).await
        }
        async fn write(&self, path: &str, data: Bytes) -> store::Result<()> {
            self.0.write(path, data).await
        }
        async fn create(&self, _path: &str, _data: Bytes) -> store::Result<bool> {
            Ok(false)
        }
        async fn stat(&self, path: &str) -> store::Result<Entry> {
            self.0.stat(path).await
        }
        async fn delete(&self, path: &str) -> store::Result<()> {
            self.0.delete(path).await
        }
    }

    async fn ledger(store: Arc<dyn Store>, identity: &SecretKey) -> Ledger {
        let db = Database::in_memory().await.unwrap();
        Ledger::new(
            store,
            db,
            "users@memory".into(),
            Realm::users(),
            identity.clone(),
        )
    }

    #[tokio::test]
    async fn test_export_then_import_elsewhere() {
        let store: Arc<dyn Store> = Arc::new(ObjectStorage::memory());
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let a = ledger(store.clone(), &alice).await;
        a.stage(&[
            Change::ChangeAccess(ChangeAccess {
                user: alice.public(),
                access: Access::READ_WRITE_ADMIN,
            }),
            Change::ChangeAccess(ChangeAccess {
                user: bob.public(),
                access: Access::READ,
            }),
        ])
        .await
        .unwrap();
        a.sync(10).await.unwrap();
        assert_eq!(a.owner().await.unwrap(), Some(alice.public()));

        // nothing left to export
        assert_eq!(a.export().await.unwrap(), ExportOutcome::Done);

        let b = ledger(store.clone(), &bob).await;
        assert_eq!(b.import().await.unwrap(), 1);
        assert_eq!(b.import().await.unwrap(), 0);
        assert_eq!(b.owner().await.unwrap(), Some(alice.public()));
        assert_eq!(b.db.access(&b.vault, &bob.public()).await.unwrap(), Access::READ);

        // a reader may add attributes about itself
        b.stage(&[Change::AddAttribute(AddAttribute {
            name: "nick".into(),
            value: "bob".into(),
        })])
        .await
        .unwrap();
        b.sync(10).await.unwrap();

        assert_eq!(a.import().await.unwrap(), 1);
        assert_eq!(
            a.db.attribute(&a.vault, &bob.public(), "nick").await.unwrap(),
            Some("bob".to_string())
        );
        assert_eq!(a.tip().await.unwrap(), b.tip().await.unwrap());
    }

    #[tokio::test]
    async fn test_contention_is_bounded() {
        let store: Arc<dyn Store> = Arc::new(Crowded(ObjectStorage::memory()));
        let alice = SecretKey::generate();
        let a = ledger(store, &alice).await;

        a.stage(&[Change::ChangeAccess(ChangeAccess {
            user: alice.public(),
            access: Access::READ_WRITE_ADMIN,
        })])
        .await
        .unwrap();

        let err = a.sync(3).await.unwrap_err();
        assert!(matches!(err, VaultError::LedgerContention(3)));
        // the change stays staged for the next attempt
        assert_eq!(a.db.staged_changes(&a.vault).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_block_aborts_import() {
        let store: Arc<dyn Store> = Arc::new(ObjectStorage::memory());
        let alice = SecretKey::generate();
        let a = ledger(store.clone(), &alice).await;

        let path = a.block_path(&GENESIS_HASH);
        store
            .write(&path, Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        let err = a.import().await.unwrap_err();
        assert!(err.is_integrity());
    }
}
