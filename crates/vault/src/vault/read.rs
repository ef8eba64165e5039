//! Reading files and browsing the index

use std::path::Path;

use bytes::Bytes;

use super::names::body_path;
use super::{IoMode, Vault, VaultEvent};
use crate::codec::{decode_body, BodyContext, Unlock};
use crate::crypto::PublicKey;
use crate::error::{Result, VaultError};
use crate::model::{clean_name, join_name, split_name, File, FileQuery, Flags};

impl Vault {
    /// Find the row a name addresses: `name`, `name:<version>` or `:<hex id>`.
    async fn resolve(&self, name: &str) -> Result<File> {
        let vault = &self.inner.id;
        let query =
            FileQuery::parse(name).ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        let file = match query {
            FileQuery::Latest { dir, name } => self
                .inner
                .db
                .latest_file(vault, &dir, &name)
                .await?
                .filter(|f| !f.is_deleted()),
            FileQuery::Version { dir, name, version } => self
                .inner
                .db
                .file_versions(vault, &dir, &name)
                .await?
                .into_iter()
                .nth(version as usize),
            FileQuery::Id(id) => self.inner.db.file_by_id(vault, id).await?,
        };
        file.ok_or_else(|| VaultError::NotFound(name.to_string()))
    }

    /// Metadata of a file, or of a directory.
    pub async fn stat(&self, name: &str) -> Result<File> {
        match self.resolve(name).await {
            Err(e) if e.is_not_found() => {
                let clean = clean_name(name);
                let (dir, base) = split_name(&clean);
                if !base.is_empty() && self.inner.db.dir_exists(&self.inner.id, dir, base).await? {
                    Ok(File::dir(clean, Default::default()))
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    /// Every live version of `name`, oldest first.
    pub async fn versions(&self, name: &str) -> Result<Vec<File>> {
        let name = clean_name(name);
        let (dir, base) = split_name(&name);
        self.inner.db.file_versions(&self.inner.id, dir, base).await
    }

    /// Subdirectories and the latest version of every file in `dir`.
    pub async fn read_dir(&self, dir: &str) -> Result<Vec<File>> {
        let dir = clean_name(dir);
        let vault = &self.inner.id;
        let mut entries: Vec<File> = self
            .inner
            .db
            .list_dirs(vault, &dir)
            .await?
            .into_iter()
            .map(|name| File::dir(join_name(&dir, &name), Default::default()))
            .collect();
        entries.extend(self.inner.db.list_files(vault, &dir).await?);
        Ok(entries)
    }

    /// Who wrote the version `name` addresses.
    pub async fn author_of(&self, name: &str) -> Result<PublicKey> {
        self.resolve(name)
            .await?
            .author
            .ok_or_else(|| VaultError::NotFound(format!("author of {}", name)))
    }

    /// Key id the version `name` addresses was encrypted with, 0 if plain.
    pub async fn key_id_of(&self, name: &str) -> Result<u64> {
        Ok(self.resolve(name).await?.key_id)
    }

    /// Read a file into memory.
    pub async fn read(&self, name: &str) -> Result<Bytes> {
        self.ensure_open()?;
        let file = self.resolve(name).await?;
        self.fetch(&file).await
    }

    /// Read a file to a local path.
    ///
    /// In `Async` and `Deferred` mode the returned file carries
    /// `PENDING_READ` until the copy is complete.
    pub async fn read_to(&self, name: &str, dest: &Path, mode: IoMode) -> Result<File> {
        self.ensure_open()?;
        let mut file = self.resolve(name).await?;
        let mut flags = file.flags;
        flags.insert(Flags::PENDING_READ);
        file.local_copy = Some(dest.to_path_buf());

        match mode {
            IoMode::Sync => {
                self.download(&file, dest).await?;
            }
            IoMode::Async => {
                self.mark_pending_read(&mut file, flags).await?;
                self.start_signal(file.id);
                let vault = self.clone();
                let pending = file.clone();
                let dest = dest.to_path_buf();
                let task = tokio::spawn(async move {
                    match vault.download(&pending, &dest).await {
                        Ok(()) => vault.emit(VaultEvent::IoCompleted(pending.id)),
                        Err(e) => {
                            tracing::error!(vault = %vault.inner.id, name = %pending.name, error = %e, "background read failed");
                            vault.emit(VaultEvent::IoFailed {
                                id: pending.id,
                                error: e.to_string(),
                            });
                        }
                    }
                    vault.finish_signal(pending.id);
                });
                self.track(task);
            }
            IoMode::Deferred => {
                self.mark_pending_read(&mut file, flags).await?;
            }
        }
        Ok(file)
    }

    async fn mark_pending_read(&self, file: &mut File, flags: Flags) -> Result<()> {
        let dest = file.local_copy.as_ref().map(|p| p.to_string_lossy().to_string());
        self.inner
            .db
            .update_local_copy(&self.inner.id, file.id, flags, dest.as_deref())
            .await?;
        file.flags = flags;
        Ok(())
    }

    /// Fetch, decode and save to `dest`, clearing `PENDING_READ`.
    pub(super) async fn download(&self, file: &File, dest: &Path) -> Result<()> {
        let data = self.fetch(file).await;
        let mut flags = file.flags;
        flags.remove(Flags::PENDING_READ);
        let dest_str = dest.to_string_lossy().to_string();

        let result = match data {
            Ok(data) => {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(dest, &data).await.map_err(VaultError::from)
            }
            Err(e) => Err(e),
        };
        // a failed read is not retried; the row goes back to its prior state
        let local_copy = result.as_ref().ok().map(|_| dest_str.as_str());
        self.inner
            .db
            .update_local_copy(&self.inner.id, file.id, flags, local_copy)
            .await?;
        result
    }

    /// Fetch and decode the body of a version.
    async fn fetch(&self, file: &File) -> Result<Bytes> {
        if file.is_deleted() {
            return Err(VaultError::NotFound(file.name.clone()));
        }
        if file.flags.contains(Flags::PENDING_WRITE) {
            return Err(VaultError::NotFound(format!("{} is not uploaded yet", file.name)));
        }

        let key;
        let unlock = if file.flags.contains(Flags::SYMMETRIC) {
            key = self
                .inner
                .db
                .key(&self.inner.id, file.key_id)
                .await?
                .ok_or_else(|| {
                    VaultError::Unauthorized(format!("no key {:x} for {}", file.key_id, file.name))
                })?;
            Unlock::Group {
                key_id: file.key_id,
                key: &key,
            }
        } else if file.flags.contains(Flags::EC) {
            Unlock::Home {
                identity: &self.inner.identity,
            }
        } else {
            Unlock::Plain
        };

        let path = body_path(&self.inner.realm, &file.store_dir, &file.store_name);
        let data = {
            let _permit = self.permit().await?;
            self.inner.store.read(&path, None).await?
        };
        let ctx = BodyContext {
            realm: self.inner.realm.as_str(),
            name: &file.name,
            store_name: &file.store_name,
        };
        let plain = decode_body(&ctx, unlock, &data)?;
        if plain.len() as u64 != file.size {
            return Err(VaultError::Integrity(format!(
                "{} has {} bytes, header says {}",
                file.name,
                plain.len(),
                file.size
            )));
        }
        tracing::debug!(vault = %self.inner.id, name = %file.name, size = file.size, "read file");
        Ok(plain.into())
    }
}
