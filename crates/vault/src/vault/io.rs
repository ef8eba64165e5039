//! Throttling, completion signals and change notification

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{watch, SemaphorePermit};
use tokio::task::JoinHandle;

use super::Vault;
use crate::error::{Result, VaultError};
use crate::model::FileId;
use crate::relay::Notification;

impl Vault {
    /// Wait for a slot among the concurrent transfers.
    pub(super) async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.inner
            .io_throttle
            .acquire()
            .await
            .map_err(|_| VaultError::Config("I/O throttle closed".into()))
    }

    /// Keep a background task so `close` can stop it.
    pub(super) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Register a completion signal for a background transfer.
    pub(super) fn start_signal(&self, id: FileId) {
        let (tx, _) = watch::channel(false);
        self.inner.signals.lock().insert(id, tx);
    }

    pub(super) fn finish_signal(&self, id: FileId) {
        if let Some(tx) = self.inner.signals.lock().remove(&id) {
            tx.send_replace(true);
        }
    }

    /// Wait for background transfers to finish.
    ///
    /// With no ids, waits for every transfer in flight. Returns `false`
    /// when the wait timeout expires first.
    pub async fn wait_files(&self, ids: &[FileId]) -> bool {
        let timeout = self.inner.config.read().wait_timeout;
        self.wait_files_for(ids, timeout).await
    }

    pub async fn wait_files_for(&self, ids: &[FileId], timeout: Duration) -> bool {
        let receivers: Vec<_> = {
            let signals = self.inner.signals.lock();
            if ids.is_empty() {
                signals.values().map(|tx| tx.subscribe()).collect()
            } else {
                ids.iter()
                    .filter_map(|id| signals.get(id).map(|tx| tx.subscribe()))
                    .collect()
            }
        };
        if receivers.is_empty() {
            return true;
        }

        let all = join_all(receivers.into_iter().map(|mut rx| async move {
            // a dropped sender has already signalled completion
            let _ = rx.wait_for(|done| *done).await;
        }));
        tokio::time::timeout(timeout, all).await.is_ok()
    }

    /// Wait until synchronization brings in files written elsewhere.
    ///
    /// Polls the store no more often than the sync cooldown. Returns
    /// `false` when `timeout` expires first.
    pub async fn wait_updates(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.new_files.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.sync_throttled().await {
                Ok(report) if report.new_files > 0 => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(vault = %self.inner.id, error = %e, "sync while waiting failed")
                }
            }

            let cooldown = self.inner.config.read().sync_cooldown;
            let next = (tokio::time::Instant::now() + cooldown).min(deadline);
            tokio::select! {
                _ = &mut notified => return true,
                _ = tokio::time::sleep_until(next) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
    }

    pub(super) fn begin_upload(&self) {
        self.inner.writers.fetch_add(1, Ordering::AcqRel);
    }

    /// Touch the change sentinel when the last upload of a burst ends.
    pub(super) async fn end_upload(&self) {
        if self.inner.writers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Err(e) = self.touch_sentinel().await {
            tracing::warn!(vault = %self.inner.id, error = %e, "failed to touch change sentinel");
        }
    }

    pub(super) async fn touch_sentinel(&self) -> Result<()> {
        let path = self.inner.realm.change_file();
        self.inner
            .store
            .write(&path, Bytes::from(self.inner.instance_id.clone()))
            .await?;
        Ok(())
    }

    /// Tell other instances about a new object, best effort.
    pub(super) async fn publish(&self, path: String) {
        let Some(notifier) = &self.inner.notifier else {
            return;
        };
        let notification = Notification {
            vault_id: self.inner.id.clone(),
            instance_id: self.inner.instance_id.clone(),
            path,
        };
        if let Err(e) = notifier.publish(&notification).await {
            tracing::warn!(vault = %self.inner.id, error = %e, "relay publish failed");
        }
    }

    /// Reserve store space for a new object.
    pub(super) fn reserve(&self, size: u64) -> Result<()> {
        let max = self.inner.config.read().max_storage;
        let mut allocated = self.inner.allocated.lock();
        if max > 0 && *allocated + size > max {
            return Err(VaultError::Capacity {
                needed: *allocated + size,
                max,
            });
        }
        *allocated += size;
        Ok(())
    }

    pub(super) fn release(&self, size: u64) {
        let mut allocated = self.inner.allocated.lock();
        *allocated = allocated.saturating_sub(size);
    }

    pub(super) async fn recompute_allocated(&self) -> Result<u64> {
        let size = self.inner.db.allocated_size(&self.inner.id).await?;
        *self.inner.allocated.lock() = size;
        Ok(size)
    }
}
