use sqlx::Row;

use super::Database;
use crate::crypto::PublicKey;
use crate::error::Result;
use crate::ledger::BlockChange;

/// An imported or exported block as recorded in the cache
#[derive(Debug, Clone)]
pub(crate) struct BlockRecord {
    /// Object name the block was stored under
    pub name: String,
    /// SHA-512 of the stored bytes, the cursor for the next import
    pub hash: Vec<u8>,
    pub block_id: u64,
    pub author: PublicKey,
    pub timestamp: i64,
}

impl Database {
    pub(crate) async fn stage_change(&self, vault: &str, change: &BlockChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO staged_changes (vault, kind, payload) VALUES (?, ?, ?)
            "#,
        )
        .bind(vault)
        .bind(change.kind as i64)
        .bind(&change.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Changes waiting for the next export, in staging order.
    pub(crate) async fn staged_changes(&self, vault: &str) -> Result<Vec<(i64, BlockChange)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload FROM staged_changes WHERE vault = ? ORDER BY id
            "#,
        )
        .bind(vault)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get("id"),
                    BlockChange {
                        kind: r.get::<i64, _>("kind") as u8,
                        payload: r.get("payload"),
                    },
                )
            })
            .collect())
    }

    /// Remove staged changes up to and including `last_id`.
    pub(crate) async fn clear_staged(&self, vault: &str, last_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM staged_changes WHERE vault = ? AND id <= ?
            "#,
        )
        .bind(vault)
        .bind(last_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn insert_block(&self, vault: &str, block: &BlockRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO blocks (vault, name, hash, block_id, author, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(vault)
        .bind(&block.name)
        .bind(&block.hash)
        .bind(block.block_id as i64)
        .bind(block.author.to_hex())
        .bind(block.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hash of the last block applied locally.
    pub(crate) async fn last_block_hash(&self, vault: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            r#"
            SELECT hash FROM blocks WHERE vault = ? ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(vault)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    /// Store name of the last block applied locally.
    pub(crate) async fn last_block_name(&self, vault: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT name FROM blocks WHERE vault = ? ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(vault)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("name")))
    }

    pub(crate) async fn block_count(&self, vault: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM blocks WHERE vault = ?
            "#,
        )
        .bind(vault)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[tokio::test]
    async fn test_stage_and_clear() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";
        for kind in 0..3u8 {
            let change = BlockChange {
                kind,
                payload: vec![kind; 4],
            };
            db.stage_change(v, &change).await.unwrap();
        }

        let staged = db.staged_changes(v).await.unwrap();
        assert_eq!(staged.len(), 3);
        assert_eq!(staged[2].1.kind, 2);

        db.clear_staged(v, staged[1].0).await.unwrap();
        let staged = db.staged_changes(v).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].1.payload, vec![2; 4]);
    }

    #[tokio::test]
    async fn test_last_block_hash() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";
        assert!(db.last_block_hash(v).await.unwrap().is_none());

        let author = SecretKey::generate().public();
        for (i, hash) in [vec![1u8; 64], vec![2u8; 64]].into_iter().enumerate() {
            let record = BlockRecord {
                name: format!("block{}", i),
                hash,
                block_id: i as u64,
                author,
                timestamp: 0,
            };
            db.insert_block(v, &record).await.unwrap();
        }
        assert_eq!(db.last_block_hash(v).await.unwrap(), Some(vec![2u8; 64]));
        assert_eq!(db.block_count(v).await.unwrap(), 2);
    }
}
