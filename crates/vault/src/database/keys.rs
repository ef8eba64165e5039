use sqlx::Row;

use super::Database;
use crate::crypto::Secret;
use crate::error::Result;

impl Database {
    /// Store a group key. Keys are immutable once known.
    pub(crate) async fn insert_key(&self, vault: &str, key_id: u64, key: &Secret) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO keys (vault, key_id, key_value) VALUES (?, ?, ?)
            "#,
        )
        .bind(vault)
        .bind(key_id as i64)
        .bind(key.bytes())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn key(&self, vault: &str, key_id: u64) -> Result<Option<Secret>> {
        let row = sqlx::query(
            r#"
            SELECT key_value FROM keys WHERE vault = ? AND key_id = ?
            "#,
        )
        .bind(vault)
        .bind(key_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(Some(Secret::from_slice(r.get::<&[u8], _>("key_value"))?)),
            None => Ok(None),
        }
    }

    /// All known keys, oldest first.
    pub(crate) async fn keys(&self, vault: &str) -> Result<Vec<(u64, Secret)>> {
        let rows = sqlx::query(
            r#"
            SELECT key_id, key_value FROM keys WHERE vault = ? ORDER BY seq
            "#,
        )
        .bind(vault)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<(u64, Secret)> {
                let key = Secret::from_slice(r.get::<&[u8], _>("key_value"))?;
                Ok((r.get::<i64, _>("key_id") as u64, key))
            })
            .collect()
    }

    /// The most recently learned key, used for new writes.
    pub(crate) async fn last_key(&self, vault: &str) -> Result<Option<(u64, Secret)>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, key_value FROM keys WHERE vault = ? ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(vault)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => {
                let key = Secret::from_slice(r.get::<&[u8], _>("key_value"))?;
                Ok(Some((r.get::<i64, _>("key_id") as u64, key)))
            }
            None => Ok(None),
        }
    }
}
