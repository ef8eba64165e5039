use serde::{Deserialize, Serialize};

use super::{BlockChange, LedgerError};
use crate::config::Config;
use crate::crypto::{PublicKey, SecretKey, SecretShare};
use crate::database::Database;
use crate::error::Result;
use crate::model::Access;

pub const CONFIG: u8 = 0;
pub const ACTIVE_KEY_SET: u8 = 1;
pub const CHANGE_ACCESS: u8 = 2;
pub const ADD_KEY: u8 = 3;
pub const ADD_ATTRIBUTE: u8 = 4;

/// Settings key the last applied `Config` change is kept under
pub(crate) const CONFIG_SETTING: &str = "config";

/// Every active key, each wrapped for one newly admitted user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveKeySet {
    pub user: PublicKey,
    pub keys: Vec<(u64, SecretShare)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAccess {
    pub user: PublicKey,
    pub access: Access,
}

/// A new group key, wrapped for every user holding access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddKey {
    pub key_id: u64,
    pub shares: Vec<(PublicKey, SecretShare)>,
}

/// A name/value pair attached to the block author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddAttribute {
    pub name: String,
    pub value: String,
}

/// A change recorded in the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Config(Config),
    ActiveKeySet(ActiveKeySet),
    ChangeAccess(ChangeAccess),
    AddKey(AddKey),
    AddAttribute(AddAttribute),
}

/// Local state a change is applied to
pub(crate) struct ApplyContext<'a> {
    pub db: &'a Database,
    pub vault: &'a str,
    pub identity: &'a SecretKey,
    /// Creator of the vault, admin regardless of recorded access
    pub owner: &'a PublicKey,
}

impl ApplyContext<'_> {
    async fn is_admin(&self, user: &PublicKey) -> Result<bool> {
        if user == self.owner {
            return Ok(true);
        }
        Ok(self.db.access(self.vault, user).await?.is_admin())
    }
}

impl Change {
    pub fn kind(&self) -> u8 {
        match self {
            Change::Config(_) => CONFIG,
            Change::ActiveKeySet(_) => ACTIVE_KEY_SET,
            Change::ChangeAccess(_) => CHANGE_ACCESS,
            Change::AddKey(_) => ADD_KEY,
            Change::AddAttribute(_) => ADD_ATTRIBUTE,
        }
    }

    pub fn encode(&self) -> std::result::Result<BlockChange, LedgerError> {
        let payload = match self {
            Change::Config(c) => bincode::serialize(c)?,
            Change::ActiveKeySet(c) => bincode::serialize(c)?,
            Change::ChangeAccess(c) => bincode::serialize(c)?,
            Change::AddKey(c) => bincode::serialize(c)?,
            Change::AddAttribute(c) => bincode::serialize(c)?,
        };
        Ok(BlockChange {
            kind: self.kind(),
            payload,
        })
    }

    /// Decode a block change. Unknown kinds give `None` so newer writers
    /// can add change types without breaking older readers.
    pub fn decode(change: &BlockChange) -> std::result::Result<Option<Self>, LedgerError> {
        let payload = &change.payload;
        let change = match change.kind {
            CONFIG => Change::Config(bincode::deserialize(payload)?),
            ACTIVE_KEY_SET => Change::ActiveKeySet(bincode::deserialize(payload)?),
            CHANGE_ACCESS => Change::ChangeAccess(bincode::deserialize(payload)?),
            ADD_KEY => Change::AddKey(bincode::deserialize(payload)?),
            ADD_ATTRIBUTE => Change::AddAttribute(bincode::deserialize(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(change))
    }

    /// Apply the change on behalf of `author`, the signer of its block.
    ///
    /// Changes an author was not entitled to make are logged and ignored.
    pub(crate) async fn apply(&self, ctx: &ApplyContext<'_>, author: &PublicKey) -> Result<()> {
        match self {
            Change::Config(config) => {
                if !ctx.is_admin(author).await? {
                    tracing::warn!(vault = ctx.vault, %author, "ignoring config change from non admin");
                    return Ok(());
                }
                let data = bincode::serialize(config).map_err(LedgerError::from)?;
                ctx.db.set_setting(ctx.vault, CONFIG_SETTING, &data).await?;
                tracing::debug!(vault = ctx.vault, "applied config change");
            }
            Change::ChangeAccess(change) => {
                if !ctx.is_admin(author).await? {
                    tracing::warn!(
                        vault = ctx.vault,
                        %author,
                        user = %change.user,
                        "ignoring access change from non admin"
                    );
                    return Ok(());
                }
                ctx.db
                    .set_access(ctx.vault, &change.user, change.access)
                    .await?;
                tracing::debug!(
                    vault = ctx.vault,
                    user = %change.user,
                    access = %change.access,
                    "applied access change"
                );
            }
            Change::AddKey(add) => {
                if !ctx.is_admin(author).await? {
                    tracing::warn!(vault = ctx.vault, %author, "ignoring key from non admin");
                    return Ok(());
                }
                let me = ctx.identity.public();
                if let Some((_, share)) = add.shares.iter().find(|(user, _)| *user == me) {
                    let key = share.recover(ctx.identity)?;
                    ctx.db.insert_key(ctx.vault, add.key_id, &key).await?;
                    tracing::debug!(vault = ctx.vault, key_id = add.key_id, "learned new key");
                }
            }
            Change::ActiveKeySet(set) => {
                if !ctx.is_admin(author).await? {
                    tracing::warn!(vault = ctx.vault, %author, "ignoring key set from non admin");
                    return Ok(());
                }
                if set.user != ctx.identity.public() {
                    return Ok(());
                }
                for (key_id, share) in &set.keys {
                    let key = share.recover(ctx.identity)?;
                    ctx.db.insert_key(ctx.vault, *key_id, &key).await?;
                }
                tracing::debug!(vault = ctx.vault, keys = set.keys.len(), "learned active keys");
            }
            Change::AddAttribute(attr) => {
                if author != ctx.owner && ctx.db.access(ctx.vault, author).await?.is_none() {
                    tracing::warn!(vault = ctx.vault, %author, "ignoring attribute from unknown user");
                    return Ok(());
                }
                ctx.db
                    .set_attribute(ctx.vault, author, &attr.name, &attr.value)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secret;

    #[test]
    fn test_unknown_kind_is_skipped() {
        let change = BlockChange {
            kind: 42,
            payload: vec![1, 2, 3],
        };
        assert!(Change::decode(&change).unwrap().is_none());

        let change = BlockChange {
            kind: CHANGE_ACCESS,
            payload: vec![1, 2, 3],
        };
        assert!(Change::decode(&change).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let user = SecretKey::generate().public();
        let change = Change::ChangeAccess(ChangeAccess {
            user,
            access: Access::READ,
        });
        let encoded = change.encode().unwrap();
        assert_eq!(encoded.kind, CHANGE_ACCESS);
        assert_eq!(Change::decode(&encoded).unwrap(), Some(change));
    }

    #[tokio::test]
    async fn test_apply_checks_admin() {
        let db = Database::in_memory().await.unwrap();
        let owner = SecretKey::generate();
        let me = SecretKey::generate();
        let stranger = SecretKey::generate().public();
        let owner_pk = owner.public();
        let ctx = ApplyContext {
            db: &db,
            vault: "users@memory",
            identity: &me,
            owner: &owner_pk,
        };

        let grant = Change::ChangeAccess(ChangeAccess {
            user: me.public(),
            access: Access::READ,
        });
        grant.apply(&ctx, &stranger).await.unwrap();
        assert!(db.access(ctx.vault, &me.public()).await.unwrap().is_none());

        grant.apply(&ctx, &owner_pk).await.unwrap();
        assert_eq!(db.access(ctx.vault, &me.public()).await.unwrap(), Access::READ);

        let key = Secret::generate();
        let add = Change::AddKey(AddKey {
            key_id: 17,
            shares: vec![(me.public(), SecretShare::new(&key, &me.public()).unwrap())],
        });
        add.apply(&ctx, &stranger).await.unwrap();
        assert!(db.key(ctx.vault, 17).await.unwrap().is_none());

        add.apply(&ctx, &owner_pk).await.unwrap();
        assert_eq!(db.key(ctx.vault, 17).await.unwrap(), Some(key));
    }
}
