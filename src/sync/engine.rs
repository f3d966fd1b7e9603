//! Reconciliation engine and remote-first mutation commands.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::panel::{AdminPatch, AdminSpec, PanelAdmin, PanelApi, PanelError};
use crate::store::{
    AdminRecord, AdminStatus, BackupBookkeeping, StateStore, StoreError, SyncCursor,
};

/// Errors surfaced by synchronizer operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// When the pass started.
    pub started_at: Option<DateTime<Utc>>,

    /// Admins present remotely but not locally, inserted into the mirror.
    pub inserted: u32,

    /// Admins present in both with divergent fields, updated locally.
    pub updated: u32,

    /// Local-only admins. Never auto-deleted; a transient remote fetch
    /// failure must not be mistaken for a deletion.
    pub orphans: Vec<String>,

    /// Admins disabled by traffic/expiry enforcement during this pass.
    pub disabled: Vec<String>,

    /// Enforcement instructions that failed on the panel side.
    pub enforcement_failures: Vec<String>,

    /// Remote mutation succeeded but the local write failed. Self-healing:
    /// the next pass re-mirrors from the panel.
    pub degraded: bool,

    /// The pass finished without partial failure and advanced the cursor.
    pub complete: bool,

    /// The admin set hash differs from the previous cursor.
    pub changed: bool,
}

/// Summary exposed through the `syncStatus` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Last successful reconciliation pass.
    pub last_sync: Option<DateTime<Utc>>,

    /// Total mirrored admins.
    pub admin_count: usize,

    /// Mirrored admins by status.
    pub active: usize,
    pub disabled: usize,
    pub expired: usize,

    /// Outcome of the most recent backup run.
    pub last_backup: Option<BackupBookkeeping>,
}

/// Reconciles the local mirror against the panel and applies admin mutations.
pub struct Synchronizer<P> {
    panel: Arc<P>,
    store: Arc<StateStore>,
}

impl<P: PanelApi> Synchronizer<P> {
    /// Creates a synchronizer over a panel client and the local store.
    #[must_use]
    pub fn new(panel: Arc<P>, store: Arc<StateStore>) -> Self {
        Self { panel, store }
    }

    /// Runs one reconciliation pass.
    ///
    /// Fetches the remote admin list, diffs it against the mirror by
    /// username, enforces traffic/expiry limits, and advances the sync
    /// cursor only when the pass completed without partial failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote list cannot be fetched or the local
    /// mirror cannot be read; in either case no cursor update happens.
    pub async fn reconcile(&self) -> SyncResult<SyncReport> {
        let now = Utc::now();
        let mut report = SyncReport {
            started_at: Some(now),
            ..SyncReport::default()
        };

        let remote = self.panel.list_admins().await?;
        let local = self.store.list()?;
        let local_by_name: HashMap<&str, &AdminRecord> =
            local.iter().map(|r| (r.username.as_str(), r)).collect();

        let mut partial_failure = false;

        // Remote is truth for traffic, expiry and status.
        for admin in &remote {
            let mut record = record_from_panel(admin, now);
            // An already-disabled admin past its expiry is mirrored as
            // expired, so a post-enforcement pass does not flip it back.
            if record.status == AdminStatus::Disabled && record.expired_at(now) {
                record.status = AdminStatus::Expired;
            }
            match local_by_name.get(admin.username.as_str()) {
                None => {
                    self.store.upsert(&record)?;
                    debug!("Mirrored new admin '{}'", record.username);
                    report.inserted += 1;
                }
                Some(existing) if differs(existing, &record) => {
                    self.store.upsert(&record)?;
                    report.updated += 1;
                }
                Some(_) => {}
            }
        }

        // Local-only records are flagged, never auto-deleted.
        let remote_names: HashMap<&str, ()> =
            remote.iter().map(|a| (a.username.as_str(), ())).collect();
        for record in &local {
            if !remote_names.contains_key(record.username.as_str()) {
                warn!(
                    "Admin '{}' exists locally but not on the panel; awaiting operator confirmation",
                    record.username
                );
                report.orphans.push(record.username.clone());
            }
        }

        // Report-then-act enforcement of traffic and expiry limits.
        for admin in self.store.list()? {
            if !admin.needs_enforcement(now) {
                continue;
            }
            let reason = if admin.expired_at(now) {
                "expiry passed"
            } else {
                "traffic quota exhausted"
            };
            info!("Disabling admin '{}': {}", admin.username, reason);

            match self.panel.edit_admin(&admin.username, &AdminPatch::disable()).await {
                Ok(updated) => {
                    let mut record = record_from_panel(&updated, now);
                    if admin.expired_at(now) {
                        record.status = AdminStatus::Expired;
                    }
                    if let Err(e) = self.store.upsert(&record) {
                        warn!(
                            "Degraded sync: '{}' disabled remotely but local write failed: {}",
                            admin.username, e
                        );
                        report.degraded = true;
                    }
                    report.disabled.push(admin.username.clone());
                }
                Err(e) => {
                    warn!("Failed to disable admin '{}': {}", admin.username, e);
                    report.enforcement_failures.push(admin.username.clone());
                    partial_failure = true;
                }
            }
        }

        if partial_failure || report.degraded {
            warn!("Reconciliation pass incomplete; sync cursor not advanced");
            return Ok(report);
        }

        let set_hash = self.store.admin_set_hash()?;
        let previous = self.store.sync_cursor()?;
        report.changed = previous.as_ref().is_none_or(|c| c.set_hash != set_hash);
        self.store.set_sync_cursor(&SyncCursor {
            last_sync: now,
            set_hash,
        })?;
        report.complete = true;

        info!(
            "Reconciliation pass done: {} inserted, {} updated, {} orphans, {} disabled",
            report.inserted,
            report.updated,
            report.orphans.len(),
            report.disabled.len()
        );
        Ok(report)
    }

    /// Creates an admin on the panel, then mirrors it locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote create fails; the mirror is untouched
    /// in that case.
    pub async fn create_admin(&self, spec: &AdminSpec) -> SyncResult<AdminRecord> {
        let created = self.panel.create_admin(spec).await?;
        let record = record_from_panel(&created, Utc::now());
        self.mirror(&record);
        info!("Created admin '{}'", record.username);
        Ok(record)
    }

    /// Deletes an admin on the panel, then removes the mirror row.
    ///
    /// Deleting an admin the panel no longer knows is a success.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote delete fails; the local record is kept.
    pub async fn delete_admin(&self, username: &str) -> SyncResult<()> {
        self.panel.delete_admin(username).await?;
        if let Err(e) = self.store.delete(username) {
            warn!(
                "Degraded sync: '{}' deleted remotely but local delete failed: {}",
                username, e
            );
        } else {
            info!("Deleted admin '{}'", username);
        }
        Ok(())
    }

    /// Applies a patch on the panel, then mirrors the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote edit fails; the mirror is untouched.
    pub async fn edit_admin(&self, username: &str, patch: &AdminPatch) -> SyncResult<AdminRecord> {
        let updated = self.panel.edit_admin(username, patch).await?;
        let record = record_from_panel(&updated, Utc::now());
        self.mirror(&record);
        info!("Edited admin '{}'", username);
        Ok(record)
    }

    /// Zeroes an admin's used traffic and reactivates the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote edit fails.
    pub async fn reset_traffic(&self, username: &str) -> SyncResult<AdminRecord> {
        self.edit_admin(username, &AdminPatch::reset_traffic()).await
    }

    /// Moves an admin's expiry timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote edit fails.
    pub async fn extend_expiry(
        &self,
        username: &str,
        new_expiry: Option<DateTime<Utc>>,
    ) -> SyncResult<AdminRecord> {
        self.edit_admin(username, &AdminPatch::extend_expiry(new_expiry)).await
    }

    /// Builds the status summary for the `syncStatus` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the mirror cannot be read.
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let admins = self.store.list()?;
        let cursor = self.store.sync_cursor()?;
        let last_backup = self.store.last_backup()?;

        Ok(SyncStatus {
            last_sync: cursor.map(|c| c.last_sync),
            admin_count: admins.len(),
            active: admins.iter().filter(|a| a.status == AdminStatus::Active).count(),
            disabled: admins.iter().filter(|a| a.status == AdminStatus::Disabled).count(),
            expired: admins.iter().filter(|a| a.status == AdminStatus::Expired).count(),
            last_backup,
        })
    }

    /// Local-second write after a successful remote mutation. A failure here
    /// is degraded sync: logged, self-healed by the next pass.
    fn mirror(&self, record: &AdminRecord) {
        if let Err(e) = self.store.upsert(record) {
            warn!(
                "Degraded sync: remote mutation for '{}' applied but local write failed: {}",
                record.username, e
            );
        }
    }
}

/// Converts a panel admin into a mirror record, verbatim.
///
/// Status is taken as the panel reports it. An active admin past its
/// expiry stays `Active` here so the enforcement loop disables it on the
/// panel before the mirror claims otherwise.
fn record_from_panel(admin: &PanelAdmin, now: DateTime<Utc>) -> AdminRecord {
    AdminRecord {
        username: admin.username.clone(),
        is_sudo: admin.is_sudo,
        data_limit: admin.data_limit,
        used_traffic: admin.used_traffic,
        expire_at: admin.expire_at,
        status: admin.status,
        synced_at: now,
    }
}

/// True when the panel-tracked fields diverge. `synced_at` is local-only.
fn differs(local: &AdminRecord, remote: &AdminRecord) -> bool {
    local.is_sudo != remote.is_sudo
        || local.data_limit != remote.data_limit
        || local.used_traffic != remote.used_traffic
        || local.expire_at != remote.expire_at
        || local.status != remote.status
}

impl<P> std::fmt::Debug for Synchronizer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer").finish_non_exhaustive()
    }
}
