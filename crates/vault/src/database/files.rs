use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::Database;
use crate::crypto::PublicKey;
use crate::error::{Result, VaultError};
use crate::model::{join_name, split_name, File, FileId, Flags};

const FILE_COLUMNS: &str = "id, dir, name, size, allocated_size, mod_time, flags, attrs, \
     key_id, store_dir, store_name, author, local_copy";

fn millis(time: &DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn file_from_row(r: &SqliteRow) -> Result<File> {
    let dir: String = r.get("dir");
    let name: String = r.get("name");
    let author: String = r.get("author");
    let author = if author.is_empty() {
        None
    } else {
        Some(
            PublicKey::from_hex(&author)
                .map_err(|e| VaultError::Integrity(format!("bad author in cache: {}", e)))?,
        )
    };
    let local_copy: Option<String> = r.get("local_copy");

    Ok(File {
        id: FileId(r.get("id")),
        name: join_name(&dir, &name),
        size: r.get::<i64, _>("size") as u64,
        allocated_size: r.get::<i64, _>("allocated_size") as u64,
        mod_time: from_millis(r.get("mod_time")),
        is_dir: false,
        flags: Flags::from_bits(r.get::<i64, _>("flags") as u32),
        attrs: r.get("attrs"),
        key_id: r.get::<i64, _>("key_id") as u64,
        store_dir: r.get("store_dir"),
        store_name: r.get("store_name"),
        author,
        local_copy: local_copy.map(PathBuf::from),
    })
}

/// Record every ancestor of `name` as a directory marker.
async fn insert_parents(
    tx: &mut Transaction<'_, Sqlite>,
    vault: &str,
    name: &str,
    mod_time: i64,
) -> Result<()> {
    let mut current = name;
    while let Some(idx) = current.rfind('/') {
        current = &current[..idx];
        let (parent, dir_name) = split_name(current);
        sqlx::query(
            r#"
            INSERT INTO dirs (vault, dir, name, mod_time) VALUES (?, ?, ?, ?)
            ON CONFLICT(vault, dir, name) DO UPDATE SET
                mod_time = MAX(mod_time, excluded.mod_time)
            "#,
        )
        .bind(vault)
        .bind(parent)
        .bind(dir_name)
        .bind(mod_time)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_row(
    tx: &mut Transaction<'_, Sqlite>,
    vault: &str,
    file: &File,
    ignore_existing: bool,
) -> Result<Option<FileId>> {
    let (dir, name) = split_name(&file.name);
    let verb = if ignore_existing {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    let sql = format!(
        "{} INTO files (vault, dir, name, size, allocated_size, mod_time, flags, attrs, \
         key_id, store_dir, store_name, author, local_copy) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        verb
    );
    let result = sqlx::query(&sql)
        .bind(vault)
        .bind(dir)
        .bind(name)
        .bind(file.size as i64)
        .bind(file.allocated_size as i64)
        .bind(millis(&file.mod_time))
        .bind(file.flags.bits() as i64)
        .bind(&file.attrs)
        .bind(file.key_id as i64)
        .bind(&file.store_dir)
        .bind(&file.store_name)
        .bind(file.author.map(|a| a.to_hex()).unwrap_or_default())
        .bind(file.local_copy.as_ref().map(|p| p.to_string_lossy().to_string()))
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    insert_parents(tx, vault, &file.name, millis(&file.mod_time)).await?;
    Ok(Some(FileId(result.last_insert_rowid())))
}

impl Database {
    /// Insert a locally created file version together with its parent directories.
    pub(crate) async fn insert_file(&self, vault: &str, file: &File) -> Result<FileId> {
        let mut tx = self.pool.begin().await?;
        let id = insert_row(&mut tx, vault, file, false).await?;
        tx.commit().await?;
        id.ok_or_else(|| VaultError::Integrity(format!("duplicate file {}", file.name)))
    }

    /// Insert a file version discovered in the store. Returns `None` when the
    /// physical name was already known.
    pub(crate) async fn import_file(&self, vault: &str, file: &File) -> Result<Option<FileId>> {
        let mut tx = self.pool.begin().await?;
        let id = insert_row(&mut tx, vault, file, true).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub(crate) async fn update_file_state(
        &self,
        vault: &str,
        id: FileId,
        flags: Flags,
        allocated_size: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files SET flags = ?, allocated_size = ? WHERE vault = ? AND id = ?
            "#,
        )
        .bind(flags.bits() as i64)
        .bind(allocated_size as i64)
        .bind(vault)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn update_local_copy(
        &self,
        vault: &str,
        id: FileId,
        flags: Flags,
        local_copy: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files SET flags = ?, local_copy = ? WHERE vault = ? AND id = ?
            "#,
        )
        .bind(flags.bits() as i64)
        .bind(local_copy)
        .bind(vault)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop a row whose write never completed.
    pub(crate) async fn delete_file(&self, vault: &str, id: FileId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM files WHERE vault = ? AND id = ?
            "#,
        )
        .bind(vault)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag every version of `dir/name` older than `mod_time` as deleted.
    pub(crate) async fn mark_versions_deleted(
        &self,
        vault: &str,
        dir: &str,
        name: &str,
        mod_time: &DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files SET flags = flags | ?
            WHERE vault = ? AND dir = ? AND name = ? AND mod_time <= ? AND (flags & ?) = 0
            "#,
        )
        .bind(Flags::DELETED.bits() as i64)
        .bind(vault)
        .bind(dir)
        .bind(name)
        .bind(millis(mod_time))
        .bind(Flags::DELETED.bits() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Modification time of the newest deleted version of a name.
    pub(crate) async fn last_deletion(
        &self,
        vault: &str,
        dir: &str,
        name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(mod_time) AS mod_time FROM files
            WHERE vault = ? AND dir = ? AND name = ? AND (flags & ?) != 0
            "#,
        )
        .bind(vault)
        .bind(dir)
        .bind(name)
        .bind(Flags::DELETED.bits() as i64)
        .fetch_one(&self.pool)
        .await?;
        let ms: Option<i64> = row.get("mod_time");
        Ok(ms.map(from_millis))
    }

    pub(crate) async fn file_by_id(&self, vault: &str, id: FileId) -> Result<Option<File>> {
        let sql = format!("SELECT {} FROM files WHERE vault = ? AND id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(vault)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Newest version of a name, deleted or not.
    pub(crate) async fn latest_file(&self, vault: &str, dir: &str, name: &str) -> Result<Option<File>> {
        let sql = format!(
            "SELECT {} FROM files WHERE vault = ? AND dir = ? AND name = ? \
             ORDER BY mod_time DESC, store_dir DESC, LENGTH(store_name) DESC, store_name DESC \
             LIMIT 1",
            FILE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(vault)
            .bind(dir)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Non deleted versions of a name, oldest first.
    pub(crate) async fn file_versions(&self, vault: &str, dir: &str, name: &str) -> Result<Vec<File>> {
        let sql = format!(
            "SELECT {} FROM files WHERE vault = ? AND dir = ? AND name = ? AND (flags & ?) = 0 \
             ORDER BY mod_time ASC, store_dir ASC, LENGTH(store_name) ASC, store_name ASC",
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(vault)
            .bind(dir)
            .bind(name)
            .bind(Flags::DELETED.bits() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Latest version of every name in `dir`, skipping deleted ones.
    pub(crate) async fn list_files(&self, vault: &str, dir: &str) -> Result<Vec<File>> {
        let sql = format!(
            r#"
            SELECT {} FROM files f
            WHERE f.vault = ? AND f.dir = ? AND f.id = (
                SELECT g.id FROM files g
                WHERE g.vault = f.vault AND g.dir = f.dir AND g.name = f.name
                ORDER BY g.mod_time DESC, g.store_dir DESC, LENGTH(g.store_name) DESC, g.store_name DESC
                LIMIT 1
            ) AND (f.flags & ?) = 0
            ORDER BY f.name
            "#,
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(vault)
            .bind(dir)
            .bind(Flags::DELETED.bits() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Direct subdirectories of `dir`.
    pub(crate) async fn list_dirs(&self, vault: &str, dir: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT name FROM dirs WHERE vault = ? AND dir = ? ORDER BY name
            "#,
        )
        .bind(vault)
        .bind(dir)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    pub(crate) async fn dir_exists(&self, vault: &str, dir: &str, name: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM dirs WHERE vault = ? AND dir = ? AND name = ?
            "#,
        )
        .bind(vault)
        .bind(dir)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Files carrying any of the given flags.
    pub(crate) async fn files_with_flags(&self, vault: &str, flags: Flags) -> Result<Vec<File>> {
        let sql = format!(
            "SELECT {} FROM files WHERE vault = ? AND (flags & ?) != 0 ORDER BY id",
            FILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(vault)
            .bind(flags.bits() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Physical names already recorded for a time bucket.
    pub(crate) async fn store_names(&self, vault: &str, store_dir: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT store_name FROM files WHERE vault = ? AND store_dir = ?
            "#,
        )
        .bind(vault)
        .bind(store_dir)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("store_name")).collect())
    }

    /// Most recent time bucket holding a known file.
    pub(crate) async fn last_store_dir(&self, vault: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(store_dir) AS store_dir FROM files WHERE vault = ?
            "#,
        )
        .bind(vault)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<Option<String>, _>("store_dir"))
    }

    /// Drop file rows last modified before `threshold`.
    pub(crate) async fn delete_files_before(
        &self,
        vault: &str,
        threshold: &DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM files WHERE vault = ? AND mod_time < ?
            "#,
        )
        .bind(vault)
        .bind(millis(threshold))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Bytes used in the store by the vault.
    pub(crate) async fn allocated_size(&self, vault: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(allocated_size), 0) AS total FROM files WHERE vault = ?
            "#,
        )
        .bind(vault)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("total") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    fn file(name: &str, store_name: &str, flags: Flags, ms: i64) -> File {
        File {
            id: FileId(0),
            name: name.to_string(),
            size: 3,
            allocated_size: 100,
            mod_time: from_millis(ms),
            is_dir: false,
            flags,
            attrs: Vec::new(),
            key_id: 7,
            store_dir: "20250101000000".to_string(),
            store_name: store_name.to_string(),
            author: Some(SecretKey::generate().public()),
            local_copy: None,
        }
    }

    #[tokio::test]
    async fn test_versions_and_listing() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";

        db.insert_file(v, &file("docs/a.txt", "a1", Flags::NONE, 1)).await.unwrap();
        db.insert_file(v, &file("docs/a.txt", "a2", Flags::NONE, 2)).await.unwrap();
        db.insert_file(v, &file("docs/b.txt", "b1", Flags::NONE, 3)).await.unwrap();
        db.insert_file(v, &file("docs/b.txt", "b2", Flags::DELETED, 4)).await.unwrap();

        let latest = db.latest_file(v, "docs", "a.txt").await.unwrap().unwrap();
        assert_eq!(latest.store_name, "a2");
        assert_eq!(latest.name, "docs/a.txt");

        let versions = db.file_versions(v, "docs", "a.txt").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].store_name, "a1");

        let listed = db.list_files(v, "docs").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "docs/a.txt");

        assert_eq!(db.list_dirs(v, "").await.unwrap(), vec!["docs".to_string()]);
        assert_eq!(db.last_deletion(v, "docs", "a.txt").await.unwrap(), None);
        assert_eq!(
            db.last_deletion(v, "docs", "b.txt").await.unwrap(),
            Some(from_millis(4))
        );
        assert_eq!(db.allocated_size(v).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_same_millisecond_orders_by_physical_name() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";

        // imported out of order: "10" follows "z" in base36
        db.import_file(v, &file("n.txt", "10", Flags::NONE, 5)).await.unwrap();
        db.import_file(v, &file("n.txt", "z", Flags::NONE, 5)).await.unwrap();

        let versions = db.file_versions(v, "", "n.txt").await.unwrap();
        let names: Vec<&str> = versions.iter().map(|f| f.store_name.as_str()).collect();
        assert_eq!(names, vec!["z", "10"]);
        assert_eq!(db.latest_file(v, "", "n.txt").await.unwrap().unwrap().store_name, "10");
        assert_eq!(db.list_files(v, "").await.unwrap()[0].store_name, "10");
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let v = "users@memory";
        let f = file("x/y/z.txt", "z1", Flags::SYMMETRIC, 10);

        assert!(db.import_file(v, &f).await.unwrap().is_some());
        assert!(db.import_file(v, &f).await.unwrap().is_none());

        let names = db.store_names(v, "20250101000000").await.unwrap();
        assert!(names.contains("z1"));
        assert_eq!(
            db.last_store_dir(v).await.unwrap().as_deref(),
            Some("20250101000000")
        );
        assert!(db.dir_exists(v, "x", "y").await.unwrap());

        assert_eq!(db.delete_files_before(v, &from_millis(11)).await.unwrap(), 1);
        assert!(db.last_store_dir(v).await.unwrap().is_none());
    }
}
