//! Discovering files written by other instances
//!
//! Writers never maintain a shared index. A reader lists the segment
//! directories from the last one it has consumed up to now, and imports
//! every header it has not recorded yet. A sentinel object rewritten after
//! each burst of uploads lets the common nothing-changed case cost a
//! single `stat`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::stream::{self, StreamExt};

use super::names::{head_path, parse_segment_dir, segment_path};
use super::{Vault, VaultEvent};
use crate::codec::{decode_head, CodecError};
use crate::crypto::{Secret, BLAKE3_HASH_SIZE, NONCE_SIZE, SECRET_SHARE_SIZE, TAG_SIZE};
use crate::error::{Result, VaultError};
use crate::model::{split_name, File, FileId, Flags};

/// Upper bound on headers decoded at once
const MAX_SYNC_WORKERS: usize = 16;

/// Settings key of the sentinel modification time last consumed
const WATERMARK_SETTING: &str = "watermark";

/// Outcome of one file synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Headers imported as new rows
    pub new_files: usize,
    /// Headers addressed to someone else or under a key not held
    pub skipped: usize,
    /// Headers that failed to download, decode or verify
    pub failed: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.new_files += other.new_files;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// What importing one header yielded
enum Imported {
    New,
    Known,
    NotForMe,
}

impl Vault {
    /// Import then export the ledger until local changes are in the chain.
    ///
    /// Returns the number of blocks added to the local chain, own ones
    /// included.
    pub async fn sync_ledger(&self) -> Result<usize> {
        let vault = &self.inner.id;
        let attempts = self.inner.config.read().ledger_sync_attempts;
        let before = self.inner.db.block_count(vault).await?;
        let exported = self.inner.ledger.sync(attempts).await?;
        let after = self.inner.db.block_count(vault).await?;

        self.load_config().await?;
        self.inner.last_runs.lock().ledger_sync = Instant::now();

        let added = after.saturating_sub(before) as usize;
        if added > 0 {
            // new keys or authors may open headers skipped or rejected before
            self.inner.rescan.store(true, Ordering::Release);
            tracing::info!(vault = %vault, blocks = added, exported, "ledger synchronized");
        }
        if exported {
            if let Some(name) = self.inner.db.last_block_name(vault).await? {
                let path = format!("{}/{}", self.inner.realm.ledger_dir(), name);
                self.publish(path).await;
            }
        }
        Ok(added)
    }

    /// Bring the file index up to date with the store.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.ensure_open()?;
        let _guard = self.inner.files_sync_lock.lock().await;
        self.sync_locked().await
    }

    /// Like [`Vault::sync`], but a no-op within the sync cooldown.
    pub(super) async fn sync_throttled(&self) -> Result<SyncReport> {
        let cooldown = self.inner.config.read().sync_cooldown;
        let recent = self
            .inner
            .last_runs
            .lock()
            .files_sync
            .is_some_and(|last| last.elapsed() < cooldown);
        if recent {
            return Ok(SyncReport::default());
        }
        self.sync().await
    }

    async fn sync_locked(&self) -> Result<SyncReport> {
        let vault = &self.inner.id;
        self.inner.last_runs.lock().files_sync = Some(Instant::now());

        let sentinel = match self.inner.store.stat(&self.inner.realm.change_file()).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(SyncReport::default()),
            Err(e) => return Err(e.into()),
        };
        let mark = sentinel
            .modified
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or_default();
        let rescan = self.inner.rescan.swap(false, Ordering::AcqRel);
        let watermark = self.inner.db.setting_num(vault, WATERMARK_SETTING).await?;
        if !rescan && watermark == Some(mark) {
            return Ok(SyncReport::default());
        }

        let from = if rescan {
            None
        } else {
            self.inner.db.last_store_dir(vault).await?
        };
        let keys: HashMap<u64, Secret> = self.inner.db.keys(vault).await?.into_iter().collect();
        let retention = self.retention_window();

        let mut segments: Vec<String> = self
            .inner
            .store
            .read_dir(&self.inner.realm.data_dir())
            .await?
            .into_iter()
            .filter(|e| e.is_dir && parse_segment_dir(&e.name).is_some())
            .map(|e| e.name)
            .filter(|name| from.as_ref().map_or(true, |from| name >= from))
            .filter(|name| !retention.is_some_and(|window| window.expired(name)))
            .collect();
        segments.sort();

        let mut report = SyncReport::default();
        for segment in &segments {
            report.merge(self.sync_segment(segment, &keys).await?);
        }

        if report.failed > 0 {
            // keep the watermark so the next sync retries from the start
            self.inner.rescan.store(true, Ordering::Release);
        } else {
            self.inner.db.set_setting_num(vault, WATERMARK_SETTING, mark).await?;
        }
        if report.new_files > 0 {
            self.recompute_allocated().await?;
            self.inner.new_files.notify_waiters();
            self.emit(VaultEvent::NewFiles(report.new_files));
        }
        if report.failed > 0 {
            tracing::warn!(vault = %vault, failed = report.failed, "some files could not be synchronized, will retry");
        }
        tracing::debug!(
            vault = %vault,
            segments = segments.len(),
            new_files = report.new_files,
            skipped = report.skipped,
            "files synchronized"
        );
        Ok(report)
    }

    async fn sync_segment(
        &self,
        segment: &str,
        keys: &HashMap<u64, Secret>,
    ) -> Result<SyncReport> {
        let heads_dir = format!("{}/h", segment_path(&self.inner.realm, segment));
        let listed = match self.inner.store.read_dir(&heads_dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(SyncReport::default()),
            Err(e) => return Err(e.into()),
        };
        let known = self.inner.db.store_names(&self.inner.id, segment).await?;
        let unseen: Vec<String> = listed
            .into_iter()
            .filter(|e| !e.is_dir && !known.contains(&e.name))
            .map(|e| e.name)
            .collect();
        if unseen.is_empty() {
            return Ok(SyncReport::default());
        }

        let workers = unseen.len().min(MAX_SYNC_WORKERS);
        let results: Vec<(String, Result<Imported>)> = stream::iter(unseen)
            .map(|name| async move {
                let result = self.import_head(segment, &name, keys).await;
                (name, result)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for (name, result) in results {
            match result {
                Ok(Imported::New) => report.new_files += 1,
                Ok(Imported::Known) => {}
                Ok(Imported::NotForMe) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(vault = %self.inner.id, segment, name = %name, error = %e, "failed to import header");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Download, open and verify one header and record it.
    async fn import_head(
        &self,
        segment: &str,
        store_name: &str,
        keys: &HashMap<u64, Secret>,
    ) -> Result<Imported> {
        let path = head_path(&self.inner.realm, segment, store_name);
        let data = {
            let _permit = self.permit().await?;
            self.inner.store.read(&path, None).await?
        };

        let policy = self.inner.realm.policy();
        let Some(signed) = decode_head(&data, policy, &self.inner.identity, keys)? else {
            return Ok(Imported::NotForMe);
        };
        let author = self
            .inner
            .db
            .identity(signed.author_id())
            .await?
            .ok_or_else(|| {
                VaultError::Integrity(format!("unknown author {:x}", signed.author_id()))
            })?;
        let key_id = signed.key_id();
        let head = signed.verify(&author)?;

        let file = File {
            id: FileId(0),
            allocated_size: data.len() as u64 + encoded_body_len(head.flags, head.size),
            name: head.name,
            size: head.size,
            mod_time: head.mod_time,
            is_dir: false,
            flags: head.flags,
            attrs: head.attrs,
            key_id,
            store_dir: segment.to_string(),
            store_name: store_name.to_string(),
            author: Some(author),
            local_copy: None,
        };
        let Some(id) = self.inner.db.import_file(&self.inner.id, &file).await? else {
            return Ok(Imported::Known);
        };
        // a tombstone may be imported before the versions it deletes
        let (dir, base) = split_name(&file.name);
        if let Some(deleted_at) = self.inner.db.last_deletion(&self.inner.id, dir, base).await? {
            self.inner
                .db
                .mark_versions_deleted(&self.inner.id, dir, base, &deleted_at)
                .await?;
        }
        tracing::debug!(vault = %self.inner.id, name = %file.name, id = %id, author = %author, "imported file");
        Ok(Imported::New)
    }

    /// Import one header announced by another instance.
    pub(super) async fn sync_file(&self, path: &str) -> Result<bool> {
        let data_dir = self.inner.realm.data_dir();
        let parts: Vec<&str> = path
            .strip_prefix(data_dir.as_str())
            .unwrap_or_default()
            .trim_start_matches('/')
            .split('/')
            .collect();
        let [segment, "h", store_name] = parts.as_slice() else {
            return Err(CodecError::Malformed(format!("not a header path: {}", path)).into());
        };
        if parse_segment_dir(segment).is_none() {
            return Err(CodecError::Malformed(format!("not a segment: {}", segment)).into());
        }

        let _guard = self.inner.files_sync_lock.lock().await;
        if self
            .inner
            .db
            .store_names(&self.inner.id, segment)
            .await?
            .contains(*store_name)
        {
            return Ok(false);
        }
        let keys: HashMap<u64, Secret> = self.inner.db.keys(&self.inner.id).await?.into_iter().collect();
        let imported = self.import_head(segment, store_name, &keys).await?;
        if matches!(imported, Imported::New) {
            self.recompute_allocated().await?;
            self.inner.new_files.notify_waiters();
            self.emit(VaultEvent::NewFiles(1));
            return Ok(true);
        }
        Ok(false)
    }
}

/// Size in the store of a body of `size` plaintext bytes.
fn encoded_body_len(flags: Flags, size: u64) -> u64 {
    if flags.contains(Flags::DELETED) {
        0
    } else if flags.contains(Flags::SYMMETRIC) {
        size + TAG_SIZE as u64
    } else if flags.contains(Flags::EC) {
        (SECRET_SHARE_SIZE + NONCE_SIZE + BLAKE3_HASH_SIZE + TAG_SIZE) as u64 + size
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_body_len() {
        assert_eq!(encoded_body_len(Flags::NONE, 11), 11);
        assert_eq!(encoded_body_len(Flags::SYMMETRIC, 11), 27);
        assert_eq!(encoded_body_len(Flags::DELETED | Flags::SYMMETRIC, 11), 0);
        assert_eq!(encoded_body_len(Flags::EC, 0), 72 + 12 + 32 + 16);
    }
}
