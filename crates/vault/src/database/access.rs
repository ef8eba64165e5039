use std::collections::BTreeMap;

use sqlx::Row;

use super::Database;
use crate::crypto::PublicKey;
use crate::error::{Result, VaultError};
use crate::model::Access;

fn parse_user(hex: &str) -> Result<PublicKey> {
    PublicKey::from_hex(hex).map_err(|e| VaultError::Integrity(format!("bad user in cache: {}", e)))
}

impl Database {
    pub(crate) async fn access(&self, vault: &str, user: &PublicKey) -> Result<Access> {
        let row = sqlx::query(
            r#"
            SELECT access FROM users WHERE vault = ? AND user = ?
            "#,
        )
        .bind(vault)
        .bind(user.to_hex())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| Access::from_bits(r.get::<i64, _>("access") as u8))
            .unwrap_or_default())
    }

    pub(crate) async fn accesses(&self, vault: &str) -> Result<BTreeMap<PublicKey, Access>> {
        let rows = sqlx::query(
            r#"
            SELECT user, access FROM users WHERE vault = ?
            "#,
        )
        .bind(vault)
        .fetch_all(&self.pool)
        .await?;

        let mut accesses = BTreeMap::new();
        for r in rows {
            let user: String = r.get("user");
            accesses.insert(
                parse_user(&user)?,
                Access::from_bits(r.get::<i64, _>("access") as u8),
            );
        }
        Ok(accesses)
    }

    /// Upsert a grant; `Access::NONE` removes the user.
    pub(crate) async fn set_access(&self, vault: &str, user: &PublicKey, access: Access) -> Result<()> {
        if access.is_none() {
            sqlx::query("DELETE FROM users WHERE vault = ? AND user = ?")
                .bind(vault)
                .bind(user.to_hex())
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO users (vault, user, access, mod_time) VALUES (?, ?, ?, ?)
            ON CONFLICT(vault, user) DO UPDATE SET
                access = excluded.access,
                mod_time = excluded.mod_time
            "#,
        )
        .bind(vault)
        .bind(user.to_hex())
        .bind(access.bits() as i64)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        self.register_identity(user).await
    }

    /// Remember a public key by its short id.
    pub(crate) async fn register_identity(&self, user: &PublicKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO identities (short_id, public_key) VALUES (?, ?)
            "#,
        )
        .bind(user.short_id() as i64)
        .bind(user.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn identity(&self, short_id: u64) -> Result<Option<PublicKey>> {
        let row = sqlx::query(
            r#"
            SELECT public_key FROM identities WHERE short_id = ?
            "#,
        )
        .bind(short_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_user(&r.get::<String, _>("public_key")))
            .transpose()
    }

    pub(crate) async fn set_attribute(
        &self,
        vault: &str,
        user: &PublicKey,
        name: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attributes (vault, user, name, value) VALUES (?, ?, ?, ?)
            ON CONFLICT(vault, user, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(vault)
        .bind(user.to_hex())
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn attribute(
        &self,
        vault: &str,
        user: &PublicKey,
        name: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM attributes WHERE vault = ? AND user = ? AND name = ?
            "#,
        )
        .bind(vault)
        .bind(user.to_hex())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub(crate) async fn attributes(
        &self,
        vault: &str,
        user: &PublicKey,
    ) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT name, value FROM attributes WHERE vault = ? AND user = ?
            "#,
        )
        .bind(vault)
        .bind(user.to_hex())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("name"), r.get("value")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[tokio::test]
    async fn test_grant_and_remove() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";
        let bob = SecretKey::generate().public();

        assert!(db.access(v, &bob).await.unwrap().is_none());
        db.set_access(v, &bob, Access::READ).await.unwrap();
        assert_eq!(db.access(v, &bob).await.unwrap(), Access::READ);
        assert_eq!(db.accesses(v).await.unwrap().len(), 1);

        db.set_access(v, &bob, Access::NONE).await.unwrap();
        assert!(db.accesses(v).await.unwrap().is_empty());

        // identities outlive grants
        assert_eq!(db.identity(bob.short_id()).await.unwrap(), Some(bob));
    }
}
