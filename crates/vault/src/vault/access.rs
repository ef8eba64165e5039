//! Access grants, group keys and user attributes

use std::collections::BTreeMap;

use super::{IoMode, Vault, VaultEvent};
use crate::config::Config;
use crate::crypto::{PublicKey, Secret, SecretShare};
use crate::error::{Result, VaultError};
use crate::ledger::{ActiveKeySet, AddAttribute, AddKey, Change, ChangeAccess};
use crate::model::{Access, RealmPolicy};

/// A random key id: never zero, top bit clear.
fn new_key_id() -> u64 {
    loop {
        let mut buff = [0u8; 8];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        let id = u64::from_le_bytes(buff) & !(1 << 63);
        if id != 0 {
            return id;
        }
    }
}

impl Vault {
    /// Grant, change or revoke access. `Access::NONE` revokes.
    ///
    /// Only the author and admins may call this. Newly admitted users get
    /// every active group key; a revocation rotates the group key so later
    /// writes are closed to the revoked user.
    pub async fn sync_access(&self, changes: &[(PublicKey, Access)], mode: IoMode) -> Result<()> {
        self.ensure_open()?;
        let me = self.public_key();
        if !self.is_admin(&me).await? {
            return Err(VaultError::Unauthorized(format!(
                "{} cannot change access in {}",
                me, self.inner.id
            )));
        }

        let staged = self.access_changes(changes).await?;
        self.inner.ledger.stage(&staged).await?;
        tracing::info!(vault = %self.inner.id, changes = staged.len(), ?mode, "staged access changes");
        self.commit_ledger(mode).await
    }

    /// Ledger changes implementing a set of access updates.
    pub(super) async fn access_changes(
        &self,
        requested: &[(PublicKey, Access)],
    ) -> Result<Vec<Change>> {
        let vault = &self.inner.id;
        let mut accesses = self.inner.db.accesses(vault).await?;
        let keys = self.inner.db.keys(vault).await?;
        let group = self.inner.realm.policy() == RealmPolicy::Group;
        let mut rotate = group && keys.is_empty();

        let mut changes = Vec::new();
        for (user, access) in requested {
            let current = accesses.get(user).copied().unwrap_or_default();
            if current.is_none() && !access.is_none() && !keys.is_empty() {
                let keys = keys
                    .iter()
                    .map(|(key_id, key)| -> Result<(u64, SecretShare)> {
                        Ok((*key_id, SecretShare::new(key, user)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                changes.push(Change::ActiveKeySet(ActiveKeySet { user: *user, keys }));
            }
            changes.push(Change::ChangeAccess(ChangeAccess {
                user: *user,
                access: *access,
            }));

            if access.is_none() {
                rotate |= group && !current.is_none();
                accesses.remove(user);
            } else {
                accesses.insert(*user, *access);
            }
        }

        if rotate {
            let key_id = new_key_id();
            let key = Secret::generate();
            let mut recipients: Vec<PublicKey> = accesses.keys().copied().collect();
            let me = self.public_key();
            if !recipients.contains(&me) && !requested.iter().any(|(u, a)| *u == me && a.is_none()) {
                recipients.push(me);
            }
            let shares = recipients
                .iter()
                .map(|user| -> Result<(PublicKey, SecretShare)> {
                    Ok((*user, SecretShare::new(&key, user)?))
                })
                .collect::<Result<Vec<_>>>()?;

            self.inner.db.insert_key(vault, key_id, &key).await?;
            changes.push(Change::AddKey(AddKey { key_id, shares }));
            tracing::debug!(vault = %vault, key_id, recipients = recipients.len(), "minted group key");
        }
        Ok(changes)
    }

    /// Record the new configuration in the ledger. Admin only.
    pub async fn set_config(&self, config: Config, mode: IoMode) -> Result<()> {
        self.ensure_open()?;
        config.validate()?;
        let me = self.public_key();
        if !self.is_admin(&me).await? {
            return Err(VaultError::Unauthorized(format!(
                "{} cannot configure {}",
                me, self.inner.id
            )));
        }
        self.inner
            .ledger
            .stage(&[Change::Config(config.normalized())])
            .await?;
        self.commit_ledger(mode).await?;
        self.load_config().await
    }

    /// Attach a name/value pair to the caller.
    pub async fn set_attribute(&self, name: &str, value: &str, mode: IoMode) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .ledger
            .stage(&[Change::AddAttribute(AddAttribute {
                name: name.to_string(),
                value: value.to_string(),
            })])
            .await?;
        self.commit_ledger(mode).await
    }

    pub async fn attribute(&self, user: &PublicKey, name: &str) -> Result<Option<String>> {
        self.inner.db.attribute(&self.inner.id, user, name).await
    }

    pub async fn attributes(&self, user: &PublicKey) -> Result<BTreeMap<String, String>> {
        self.inner.db.attributes(&self.inner.id, user).await
    }

    /// Access recorded for `user`. The author always holds full access.
    pub async fn access(&self, user: &PublicKey) -> Result<Access> {
        if self.inner.ledger.owner().await?.as_ref() == Some(user) {
            return Ok(Access::READ_WRITE_ADMIN);
        }
        self.inner.db.access(&self.inner.id, user).await
    }

    /// Every user with access.
    pub async fn accesses(&self) -> Result<BTreeMap<PublicKey, Access>> {
        self.inner.db.accesses(&self.inner.id).await
    }

    pub(super) async fn is_admin(&self, user: &PublicKey) -> Result<bool> {
        Ok(self.access(user).await?.is_admin())
    }

    pub(super) async fn has_access(&self, user: &PublicKey) -> Result<bool> {
        Ok(!self.access(user).await?.is_none())
    }

    /// Export staged ledger changes as `mode` says.
    pub(super) async fn commit_ledger(&self, mode: IoMode) -> Result<()> {
        match mode {
            IoMode::Sync => self.sync_ledger().await.map(|_| ()),
            IoMode::Async => {
                let vault = self.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = vault.sync_ledger().await {
                        tracing::error!(vault = %vault.inner.id, error = %e, "background ledger sync failed");
                        vault.emit(VaultEvent::LedgerFailed(e.to_string()));
                    }
                });
                self.track(task);
                Ok(())
            }
            IoMode::Deferred => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ids() {
        for _ in 0..100 {
            let id = new_key_id();
            assert_ne!(id, 0);
            assert_eq!(id >> 63, 0);
        }
    }
}
