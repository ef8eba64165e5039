//! Writing and deleting file versions

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::names::{body_path, head_path, physical_name, segment_dir};
use super::{IoMode, Vault, VaultEvent};
use crate::codec::{encode_body, encode_head, BodyContext, CodecError, Head, Protection};
use crate::crypto::PublicKey;
use crate::error::{Result, VaultError};
use crate::model::{clean_name, split_name, File, FileId, FileQuery, Flags, RealmPolicy};

/// Encoded objects of a version waiting for upload
struct Encoded {
    head: Bytes,
    body: Option<Bytes>,
}

/// Current time at the precision headers carry.
pub(super) fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn staged_head(body: &Path) -> PathBuf {
    body.with_extension("h")
}

impl Vault {
    /// Write a new version of `name`.
    ///
    /// In `Async` and `Deferred` mode the returned file still carries
    /// `PENDING_WRITE`.
    pub async fn write(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        attrs: &[u8],
        mode: IoMode,
    ) -> Result<File> {
        self.put_version(name, data.into(), attrs, Flags::NONE, mode)
            .await
    }

    /// Delete `name`: record a tombstone version and drop the bodies of
    /// every earlier version from the store.
    ///
    /// The tombstone is always uploaded before returning, so other
    /// instances stop listing the name before any body disappears. `mode`
    /// only applies to removing the bodies.
    pub async fn delete(&self, name: &str, mode: IoMode) -> Result<File> {
        let name = clean_name(name);
        let (dir, base) = split_name(&name);
        let latest = self
            .inner
            .db
            .latest_file(&self.inner.id, dir, base)
            .await?
            .filter(|f| !f.is_deleted())
            .ok_or_else(|| VaultError::NotFound(name.clone()))?;
        let versions = self.inner.db.file_versions(&self.inner.id, dir, base).await?;

        let tombstone = self
            .put_version(&name, Bytes::new(), &[], Flags::DELETED, IoMode::Sync)
            .await?;

        let mut wiped = Vec::with_capacity(versions.len());
        for mut version in versions {
            version.flags.insert(Flags::DELETED);
            if mode != IoMode::Sync {
                version.flags.insert(Flags::PENDING_WIPE);
            }
            self.inner
                .db
                .update_file_state(&self.inner.id, version.id, version.flags, version.allocated_size)
                .await?;
            wiped.push(version);
        }
        // versions imported meanwhile
        self.inner
            .db
            .mark_versions_deleted(&self.inner.id, dir, base, &tombstone.mod_time)
            .await?;

        match mode {
            IoMode::Sync => {
                for version in &wiped {
                    if let Err(e) = self.wipe_body(version).await {
                        tracing::warn!(vault = %self.inner.id, name = %name, id = %version.id, error = %e, "failed to delete body");
                    }
                }
            }
            IoMode::Async => {
                for version in &wiped {
                    self.start_signal(version.id);
                }
                let vault = self.clone();
                let task = tokio::spawn(async move {
                    for version in wiped {
                        match vault.wipe_body(&version).await {
                            Ok(()) => vault.emit(VaultEvent::IoCompleted(version.id)),
                            Err(e) => {
                                tracing::warn!(vault = %vault.inner.id, id = %version.id, error = %e, "background body delete failed");
                                vault.emit(VaultEvent::IoFailed {
                                    id: version.id,
                                    error: e.to_string(),
                                });
                            }
                        }
                        vault.finish_signal(version.id);
                    }
                });
                self.track(task);
            }
            IoMode::Deferred => {}
        }
        tracing::info!(vault = %self.inner.id, name = %name, id = %latest.id, ?mode, "deleted file");
        Ok(tombstone)
    }

    /// Remove the body of a deleted version and clear `PENDING_WIPE`.
    pub(super) async fn wipe_body(&self, file: &File) -> Result<()> {
        let path = body_path(&self.inner.realm, &file.store_dir, &file.store_name);
        {
            let _permit = self.permit().await?;
            match self.inner.store.delete(&path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if file.flags.contains(Flags::PENDING_WIPE) {
            let mut flags = file.flags;
            flags.remove(Flags::PENDING_WIPE);
            self.inner
                .db
                .update_file_state(&self.inner.id, file.id, flags, file.allocated_size)
                .await?;
        }
        tracing::debug!(vault = %self.inner.id, name = %file.name, id = %file.id, "deleted body");
        Ok(())
    }

    /// How a new version of `name` is protected in this realm.
    async fn protection_for(&self, name: &str) -> Result<Protection> {
        match self.inner.realm.policy() {
            RealmPolicy::Public => Ok(Protection::Plain),
            RealmPolicy::Home => {
                let first = name.split('/').next().unwrap_or_default();
                let recipient = PublicKey::from_hex(first)
                    .map_err(|_| CodecError::Recipient(name.to_string()))?;
                Ok(Protection::Home { recipient })
            }
            RealmPolicy::Group => {
                let (key_id, key) = self
                    .inner
                    .db
                    .last_key(&self.inner.id)
                    .await?
                    .ok_or_else(|| {
                        VaultError::Unauthorized(format!(
                            "no group key available in {}",
                            self.inner.id
                        ))
                    })?;
                Ok(Protection::Group { key_id, key })
            }
        }
    }

    async fn put_version(
        &self,
        name: &str,
        data: Bytes,
        attrs: &[u8],
        extra: Flags,
        mode: IoMode,
    ) -> Result<File> {
        self.ensure_open()?;
        let name = clean_name(name);
        if name.is_empty() || matches!(FileQuery::parse(&name), Some(FileQuery::Id(_))) {
            return Err(VaultError::Config(format!("invalid file name {:?}", name)));
        }
        let me = self.public_key();
        if !self.access(&me).await?.can_write() {
            return Err(VaultError::Unauthorized(format!(
                "{} cannot write to {}",
                me, self.inner.id
            )));
        }

        let protection = self.protection_for(&name).await?;
        let now = now_ms();
        let interval = self.inner.config.read().segment_interval;
        let store_dir = segment_dir(now, interval);
        let store_name = physical_name(now);
        let flags = protection.flags() | extra;

        let head = Head {
            name: name.clone(),
            size: data.len() as u64,
            mod_time: now,
            flags,
            attrs: attrs.to_vec(),
        };
        let encoded = Encoded {
            head: encode_head(&self.inner.identity, &head, &protection)?.into(),
            body: if extra.contains(Flags::DELETED) {
                None
            } else {
                let ctx = BodyContext {
                    realm: self.inner.realm.as_str(),
                    name: &name,
                    store_name: &store_name,
                };
                Some(encode_body(&ctx, &protection, &data)?.into())
            },
        };
        let allocated_size =
            (encoded.head.len() + encoded.body.as_ref().map_or(0, |b| b.len())) as u64;
        self.reserve(allocated_size)?;

        let mut file = File {
            id: FileId(0),
            name,
            size: head.size,
            allocated_size,
            mod_time: now,
            is_dir: false,
            flags: flags | Flags::PENDING_WRITE,
            attrs: head.attrs,
            key_id: protection.key_id(),
            store_dir,
            store_name,
            author: Some(me),
            local_copy: None,
        };

        if mode == IoMode::Deferred {
            match self.stage_locally(&file, &encoded).await {
                Ok(path) => file.local_copy = Some(path),
                Err(e) => {
                    self.release(allocated_size);
                    return Err(e);
                }
            }
        }
        file.id = match self.inner.db.insert_file(&self.inner.id, &file).await {
            Ok(id) => id,
            Err(e) => {
                self.release(allocated_size);
                return Err(e);
            }
        };
        tracing::debug!(vault = %self.inner.id, name = %file.name, id = %file.id, ?mode, "new version");

        match mode {
            IoMode::Sync => {
                if let Err(e) = self.upload(&file, encoded).await {
                    self.rollback(&file).await;
                    return Err(e);
                }
                file.flags.remove(Flags::PENDING_WRITE);
            }
            IoMode::Async => {
                self.start_signal(file.id);
                let vault = self.clone();
                let pending = file.clone();
                let task = tokio::spawn(async move {
                    match vault.upload(&pending, encoded).await {
                        Ok(()) => vault.emit(VaultEvent::IoCompleted(pending.id)),
                        Err(e) => {
                            tracing::error!(vault = %vault.inner.id, name = %pending.name, error = %e, "background write failed");
                            vault.rollback(&pending).await;
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
            IoMode::Deferred => {}
        }
        Ok(file)
    }

    /// Write the encoded objects of a deferred version to the staging dir.
    async fn stage_locally(&self, file: &File, encoded: &Encoded) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.inner.staging_dir).await?;
        let body = self.inner.staging_dir.join(format!("{}.b", file.store_name));
        tokio::fs::write(staged_head(&body), &encoded.head).await?;
        if let Some(data) = &encoded.body {
            tokio::fs::write(&body, data).await?;
        }
        Ok(body)
    }

    /// Put both objects in the store, the header last so a reader never
    /// finds a header without its body.
    async fn put_objects(&self, file: &File, head: &str, encoded: Encoded) -> Result<()> {
        let _permit = self.permit().await?;
        if let Some(body) = encoded.body {
            let path = body_path(&self.inner.realm, &file.store_dir, &file.store_name);
            self.inner.store.write(&path, body).await?;
        }
        self.inner.store.write(head, encoded.head).await?;
        Ok(())
    }

    async fn upload(&self, file: &File, encoded: Encoded) -> Result<()> {
        let head = head_path(&self.inner.realm, &file.store_dir, &file.store_name);
        self.begin_upload();
        let mut result = self.put_objects(file, &head, encoded).await;
        if result.is_ok() {
            let mut flags = file.flags;
            flags.remove(Flags::PENDING_WRITE);
            result = self
                .inner
                .db
                .update_file_state(&self.inner.id, file.id, flags, file.allocated_size)
                .await;
        }
        self.end_upload().await;

        if result.is_ok() {
            tracing::debug!(vault = %self.inner.id, name = %file.name, id = %file.id, "uploaded");
            self.publish(head).await;
        }
        result
    }

    /// Forget a version whose upload failed.
    async fn rollback(&self, file: &File) {
        self.release(file.allocated_size);
        if let Err(e) = self.inner.db.delete_file(&self.inner.id, file.id).await {
            tracing::error!(vault = %self.inner.id, id = %file.id, error = %e, "failed to drop pending row");
        }
        for path in [
            head_path(&self.inner.realm, &file.store_dir, &file.store_name),
            body_path(&self.inner.realm, &file.store_dir, &file.store_name),
        ] {
            let _ = self.inner.store.delete(&path).await;
        }
        if let Some(body) = &file.local_copy {
            let _ = tokio::fs::remove_file(staged_head(body)).await;
            let _ = tokio::fs::remove_file(body).await;
        }
    }

    /// Upload one deferred version from the staging dir.
    pub(super) async fn flush_pending_write(&self, file: &File) -> Result<()> {
        let Some(body) = &file.local_copy else {
            // an async write that never finished; its data is gone
            tracing::warn!(vault = %self.inner.id, name = %file.name, "dropping orphaned pending write");
            self.rollback(file).await;
            return Ok(());
        };
        let encoded = Encoded {
            head: tokio::fs::read(staged_head(body)).await?.into(),
            body: if file.is_deleted() {
                None
            } else {
                Some(tokio::fs::read(body).await?.into())
            },
        };
        if let Err(e) = self.upload(file, encoded).await {
            // transient failures stay pending for the next sweep
            if !e.is_transient() {
                self.rollback(file).await;
            }
            return Err(e);
        }

        let mut flags = file.flags;
        flags.remove(Flags::PENDING_WRITE);
        self.inner
            .db
            .update_local_copy(&self.inner.id, file.id, flags, None)
            .await?;
        let _ = tokio::fs::remove_file(staged_head(body)).await;
        let _ = tokio::fs::remove_file(body).await;
        Ok(())
    }
}
