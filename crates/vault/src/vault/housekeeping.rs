//! Periodic maintenance and relay notifications
//!
//! One timer drives every cadence: each tick checks how long ago the ledger
//! sync, the files sync with its pending sweep, and the retention cleanup
//! last ran, and runs whichever is due. Failures are logged and reported as
//! [`VaultEvent::HousekeepingFailed`], never propagated.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::names::{parse_segment_dir, segment_path};
use super::{Vault, VaultEvent, VaultInner};
use crate::error::Result;
use crate::model::Flags;
use crate::relay::Notification;

/// Shortest housekeeping tick
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Files modified before `threshold` are past retention
#[derive(Debug, Clone, Copy)]
pub(super) struct RetentionWindow {
    threshold: DateTime<Utc>,
    interval: chrono::Duration,
}

impl RetentionWindow {
    /// Whether the segment named `segment` ends inside the expired range.
    pub(super) fn expired(&self, segment: &str) -> bool {
        parse_segment_dir(segment)
            .and_then(|start| start.checked_add_signed(self.interval))
            .is_some_and(|end| end <= self.threshold)
    }
}

impl Vault {
    pub(super) fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let weak: Weak<VaultInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tracing::debug!("housekeeping started");
            loop {
                // re-read every round; a ledger config change may shorten it
                let period = match weak.upgrade() {
                    Some(inner) => inner.config.read().housekeeping_period(),
                    None => break,
                };
                tokio::time::sleep(period.max(MIN_PERIOD)).await;

                let Some(inner) = weak.upgrade() else { break };
                let vault = Vault { inner };
                if vault.is_closed() {
                    break;
                }
                vault.housekeeping().await;
            }
            tracing::debug!("housekeeping stopped");
        })
    }

    /// Run every maintenance step whose period has elapsed.
    pub async fn housekeeping(&self) {
        let (ledger_due, files_due, cleanup_due) = {
            let config = self.inner.config.read();
            let runs = self.inner.last_runs.lock();
            (
                runs.ledger_sync.elapsed() >= config.ledger_sync_period,
                runs.sweep.elapsed() >= config.files_sync_period,
                runs.cleanup.elapsed() >= config.cleanup_period,
            )
        };

        if ledger_due {
            if let Err(e) = self.sync_ledger().await {
                self.housekeeping_failed("ledger sync", e.to_string());
            }
        }
        if files_due {
            self.inner.last_runs.lock().sweep = Instant::now();
            if let Err(e) = self.sync().await {
                self.housekeeping_failed("files sync", e.to_string());
            }
            if let Err(e) = self.sweep_pending().await {
                self.housekeeping_failed("pending sweep", e.to_string());
            }
        }
        if cleanup_due {
            self.inner.last_runs.lock().cleanup = Instant::now();
            if let Err(e) = self.cleanup().await {
                self.housekeeping_failed("retention cleanup", e.to_string());
            }
        }
    }

    fn housekeeping_failed(&self, step: &str, error: String) {
        tracing::error!(vault = %self.inner.id, step, error = %error, "housekeeping step failed");
        self.emit(VaultEvent::HousekeepingFailed(format!("{}: {}", step, error)));
    }

    /// Complete every deferred operation now instead of at the next sweep.
    pub async fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        self.sweep_pending().await
    }

    /// Upload deferred writes, download deferred reads, remove the bodies
    /// of deferred deletes and export staged ledger changes. Returns how
    /// many files were completed.
    async fn sweep_pending(&self) -> Result<usize> {
        let vault = &self.inner.id;
        if !self.inner.db.staged_changes(vault).await?.is_empty() {
            self.sync_ledger().await?;
        }

        let pending = self
            .inner
            .db
            .files_with_flags(
                vault,
                Flags::PENDING_WRITE | Flags::PENDING_READ | Flags::PENDING_WIPE,
            )
            .await?;
        let mut done = 0;
        let mut failed = 0;
        for file in pending {
            // transfers running in this process finish on their own
            if self.inner.signals.lock().contains_key(&file.id) {
                continue;
            }
            let result = if file.flags.contains(Flags::PENDING_WRITE) {
                self.flush_pending_write(&file).await
            } else if file.flags.contains(Flags::PENDING_WIPE) {
                self.wipe_body(&file).await
            } else if let Some(dest) = file.local_copy.clone() {
                self.download(&file, &dest).await
            } else {
                let mut flags = file.flags;
                flags.remove(Flags::PENDING_READ);
                self.inner
                    .db
                    .update_local_copy(vault, file.id, flags, None)
                    .await
            };
            match result {
                Ok(()) => {
                    done += 1;
                    self.emit(VaultEvent::IoCompleted(file.id));
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(vault = %vault, name = %file.name, id = %file.id, error = %e, "pending transfer failed");
                    self.emit(VaultEvent::IoFailed {
                        id: file.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        if done > 0 || failed > 0 {
            tracing::info!(vault = %vault, done, failed, "swept pending transfers");
        }
        Ok(done)
    }

    /// The retention window as of now, `None` when it reaches back past
    /// the earliest representable time.
    pub(super) fn retention_window(&self) -> Option<RetentionWindow> {
        let (retention, interval) = {
            let config = self.inner.config.read();
            (config.retention, config.segment_interval)
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let threshold = Utc::now().checked_sub_signed(retention)?;
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        Some(RetentionWindow {
            threshold,
            interval,
        })
    }

    /// Drop segments and rows older than the retention window.
    pub(super) async fn cleanup(&self) -> Result<u64> {
        let vault = &self.inner.id;
        let Some(window) = self.retention_window() else {
            return Ok(0);
        };
        let threshold = window.threshold;

        let mut removed_segments = 0;
        if self.access(&self.public_key()).await?.can_write() {
            let entries = match self.inner.store.read_dir(&self.inner.realm.data_dir()).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            for entry in entries.into_iter().filter(|e| e.is_dir) {
                if !window.expired(&entry.name) {
                    continue;
                }
                let path = segment_path(&self.inner.realm, &entry.name);
                let _permit = self.permit().await?;
                match self.inner.store.delete(&path).await {
                    Ok(()) => removed_segments += 1,
                    Err(e) => {
                        tracing::warn!(vault = %vault, path = %path, error = %e, "failed to delete segment")
                    }
                }
            }
        }

        let removed_rows = self.inner.db.delete_files_before(vault, &threshold).await?;
        let allocated = self.recompute_allocated().await?;
        tracing::info!(
            vault = %vault,
            segments = removed_segments,
            rows = removed_rows,
            allocated,
            "retention cleanup"
        );
        Ok(removed_rows)
    }

    /// Act on notifications from other instances until the relay closes.
    pub(super) fn spawn_listener(&self, rx: flume::Receiver<Notification>) -> JoinHandle<()> {
        let weak: Weak<VaultInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Ok(notification) = rx.recv_async().await {
                let Some(inner) = weak.upgrade() else { break };
                let vault = Vault { inner };
                if vault.is_closed() {
                    break;
                }
                vault.on_notification(notification).await;
            }
        })
    }

    async fn on_notification(&self, notification: Notification) {
        if notification.instance_id == self.inner.instance_id
            || notification.vault_id != self.inner.id
        {
            return;
        }
        let path = notification.path.as_str();
        let result = if path.starts_with(&self.inner.realm.ledger_dir()) {
            self.sync_ledger().await.map(|_| ())
        } else if path.starts_with(&self.inner.realm.data_dir()) && path.contains("/h/") {
            self.sync_file(path).await.map(|_| ())
        } else {
            return;
        };
        if let Err(e) = result {
            tracing::warn!(vault = %self.inner.id, path, error = %e, "failed to act on notification");
        }
    }
}
