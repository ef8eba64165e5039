use sqlx::Row;

use super::Database;
use crate::error::Result;

impl Database {
    pub(crate) async fn set_setting(&self, vault: &str, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (vault, key, value) VALUES (?, ?, ?)
            ON CONFLICT(vault, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(vault)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn setting(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM settings WHERE vault = ? AND key = ?
            "#,
        )
        .bind(vault)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get("value")))
    }

    pub(crate) async fn set_setting_num(&self, vault: &str, key: &str, num: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (vault, key, num) VALUES (?, ?, ?)
            ON CONFLICT(vault, key) DO UPDATE SET num = excluded.num
            "#,
        )
        .bind(vault)
        .bind(key)
        .bind(num)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn setting_num(&self, vault: &str, key: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT num FROM settings WHERE vault = ? AND key = ?
            "#,
        )
        .bind(vault)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get("num")))
    }

    /// Forget everything cached for a vault.
    pub(crate) async fn reset_vault(&self, vault: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "files",
            "dirs",
            "users",
            "keys",
            "attributes",
            "staged_changes",
            "blocks",
            "settings",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE vault = ?", table))
                .bind(vault)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";

        assert!(db.setting(v, "config").await.unwrap().is_none());
        db.set_setting(v, "config", b"abc").await.unwrap();
        db.set_setting_num(v, "watermark", 42).await.unwrap();
        db.set_setting_num(v, "watermark", 43).await.unwrap();

        assert_eq!(db.setting(v, "config").await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(db.setting_num(v, "watermark").await.unwrap(), Some(43));

        db.reset_vault(v).await.unwrap();
        assert!(db.setting_num(v, "watermark").await.unwrap().is_none());
    }
}
