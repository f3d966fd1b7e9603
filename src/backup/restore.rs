//! Restore executor: replays an archive into the store and the panel.
//!
//! Restore is best-effort: the local snapshot lands in one transaction, then
//! the panel export is re-applied admin-by-admin. Per-admin failures are
//! reported, not rolled back.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::archive::{Archive, ArchiveError};
use crate::panel::{AdminPatch, AdminSpec, PanelAdmin, PanelApi, PanelError};
use crate::store::{StateStore, StoreError};

/// Restore errors.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to list panel admins before replay: {0}")]
    Panel(#[from] PanelError),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How one admin from the export was applied to the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreAction {
    /// The admin existed on the panel and was patched.
    Updated,
    /// The admin was recreated with a placeholder password.
    Created,
    /// The panel call failed; the error is in `error`.
    Failed,
}

/// Per-identifier replay result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApplyResult {
    pub username: String,
    pub action: RestoreAction,
    pub error: Option<String>,
}

/// Outcome of a restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub archive_id: String,

    /// Admin records restored into the local mirror.
    pub local_restored: usize,

    /// Per-admin panel replay results, in export order.
    pub admins: Vec<AdminApplyResult>,
}

impl RestoreReport {
    /// Number of admins that failed to apply on the panel.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.admins
            .iter()
            .filter(|a| a.action == RestoreAction::Failed)
            .count()
    }
}

/// Validates and replays backup archives.
pub struct RestoreExecutor<P> {
    panel: Arc<P>,
    store: Arc<StateStore>,
}

impl<P: PanelApi> RestoreExecutor<P> {
    /// Creates a restore executor.
    #[must_use]
    pub fn new(panel: Arc<P>, store: Arc<StateStore>) -> Self {
        Self { panel, store }
    }

    /// Restores the archive at `path`.
    ///
    /// Fails fast with `CorruptArchive` before touching any state; after
    /// validation the local snapshot is applied in one transaction and the
    /// panel export is replayed per admin.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, the local restore, or the initial
    /// panel listing fails. Per-admin replay failures are reported in the
    /// returned list instead.
    pub async fn restore(&self, path: impl AsRef<Path>) -> Result<RestoreReport, RestoreError> {
        let archive = Archive::load(path)?;
        archive.validate()?;
        info!("Restoring archive {}", archive.manifest.id);

        // Local snapshot first: materialize it, read the rows back, swap the
        // admin set transactionally. Current state survives any failure here.
        let scratch = tempfile::tempdir()?;
        let snapshot_path = scratch.path().join("restore_snapshot.db");
        std::fs::write(&snapshot_path, archive.snapshot_bytes()?)?;

        let snapshot_store = StateStore::open(&snapshot_path)?;
        let records = snapshot_store.list()?;
        self.store.replace_all(&records)?;
        info!("Restored {} admin records into the local mirror", records.len());

        // Panel replay: the panel has no bulk import, so each admin is
        // created or patched individually.
        let existing = self.panel.list_admins().await?;
        let existing: std::collections::HashSet<String> =
            existing.into_iter().map(|a| a.username).collect();

        let mut results = Vec::with_capacity(archive.panel_export.admins.len());
        for admin in &archive.panel_export.admins {
            let result = if existing.contains(&admin.username) {
                self.replay_edit(admin).await
            } else {
                self.replay_create(admin, &archive.manifest.checksum).await
            };
            if let Some(err) = &result.error {
                warn!("Restore of admin '{}' failed: {}", admin.username, err);
            }
            results.push(result);
        }

        Ok(RestoreReport {
            archive_id: archive.manifest.id,
            local_restored: records.len(),
            admins: results,
        })
    }

    /// Restores the archive with the given id from `backup_dir`.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::NotFound` if no archive with that id exists,
    /// plus anything [`restore`](Self::restore) can return.
    pub async fn restore_by_id(
        &self,
        backup_dir: impl AsRef<Path>,
        id: &str,
    ) -> Result<RestoreReport, RestoreError> {
        let path = backup_dir
            .as_ref()
            .join(format!("{id}.{}", super::archive::ARCHIVE_EXT));
        self.restore(path).await
    }

    async fn replay_edit(&self, admin: &PanelAdmin) -> AdminApplyResult {
        let patch = AdminPatch {
            password: None,
            is_sudo: Some(admin.is_sudo),
            data_limit: Some(admin.data_limit),
            used_traffic: Some(admin.used_traffic),
            expire_at: Some(admin.expire_at),
            status: Some(admin.status),
        };
        match self.panel.edit_admin(&admin.username, &patch).await {
            Ok(_) => AdminApplyResult {
                username: admin.username.clone(),
                action: RestoreAction::Updated,
                error: None,
            },
            Err(e) => AdminApplyResult {
                username: admin.username.clone(),
                action: RestoreAction::Failed,
                error: Some(e.to_string()),
            },
        }
    }

    async fn replay_create(&self, admin: &PanelAdmin, checksum: &str) -> AdminApplyResult {
        let spec = AdminSpec {
            username: admin.username.clone(),
            password: placeholder_password(checksum, &admin.username),
            is_sudo: admin.is_sudo,
            data_limit: admin.data_limit,
            expire_at: admin.expire_at,
        };
        match self.panel.create_admin(&spec).await {
            Ok(_) => AdminApplyResult {
                username: admin.username.clone(),
                action: RestoreAction::Created,
                error: None,
            },
            Err(e) => AdminApplyResult {
                username: admin.username.clone(),
                action: RestoreAction::Failed,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Deterministic placeholder for recreated admins.
///
/// Panel exports carry no passwords. The operator is expected to rotate the
/// credential after restore; the per-admin result marks these as `created`.
fn placeholder_password(checksum: &str, username: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(checksum.as_bytes());
    hasher.update(b":");
    hasher.update(username.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("restore-{}", &digest[..16])
}

impl<P> std::fmt::Debug for RestoreExecutor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupScheduler;
    use crate::store::AdminStatus;
    use crate::sync::Synchronizer;
    use crate::testing::{MockPanel, panel_admin};
    use std::time::Duration;

    async fn archive_of(
        panel: &Arc<MockPanel>,
        store: &Arc<StateStore>,
    ) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let sched = BackupScheduler::new(
            Arc::clone(panel),
            Arc::clone(store),
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            5,
        );
        let manifest = sched.run_now().await.unwrap();
        let path = dir.path().join(format!("{}.archive", manifest.id));
        (dir, path)
    }

    #[tokio::test]
    async fn test_round_trip_reproduces_admin_set() {
        let panel = Arc::new(MockPanel::with_admins(vec![
            panel_admin("alice"),
            panel_admin("bob"),
        ]));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Synchronizer::new(Arc::clone(&panel), Arc::clone(&store))
            .reconcile()
            .await
            .unwrap();
        let before = store.list().unwrap();

        let (_dir, archive_path) = archive_of(&panel, &store).await;

        // Wipe both sides, then restore.
        let fresh_store = Arc::new(StateStore::open_in_memory().unwrap());
        let fresh_panel = Arc::new(MockPanel::default());
        let executor = RestoreExecutor::new(Arc::clone(&fresh_panel), Arc::clone(&fresh_store));
        let report = executor.restore(&archive_path).await.unwrap();

        assert_eq!(report.local_restored, 2);
        assert_eq!(report.failures(), 0);

        let after = fresh_store.list().unwrap();
        assert_eq!(after.len(), before.len());
        for (a, b) in after.iter().zip(before.iter()) {
            assert_eq!(a.username, b.username);
            assert_eq!(a.data_limit, b.data_limit);
            assert_eq!(a.expire_at, b.expire_at);
        }
        assert_eq!(fresh_panel.admins.lock().unwrap().len(), 2, "admins recreated");
    }

    #[tokio::test]
    async fn test_corrupt_archive_leaves_state_untouched() {
        let panel = Arc::new(MockPanel::with_admins(vec![panel_admin("alice")]));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Synchronizer::new(Arc::clone(&panel), Arc::clone(&store))
            .reconcile()
            .await
            .unwrap();
        let (_dir, archive_path) = archive_of(&panel, &store).await;

        // Flip the recorded checksum.
        let mut archive = Archive::load(&archive_path).unwrap();
        archive.manifest.checksum = "0".repeat(64);
        let json = serde_json::to_vec(&archive).unwrap();
        std::fs::write(&archive_path, json).unwrap();

        let target_store = Arc::new(StateStore::open_in_memory().unwrap());
        target_store
            .upsert(&store.get("alice").unwrap().unwrap())
            .unwrap();
        let executor = RestoreExecutor::new(Arc::clone(&panel), Arc::clone(&target_store));

        let result = executor.restore(&archive_path).await;

        assert!(matches!(
            result,
            Err(RestoreError::Archive(ArchiveError::Corrupt(_)))
        ));
        assert_eq!(target_store.list().unwrap().len(), 1, "state untouched");
    }

    #[tokio::test]
    async fn test_partial_panel_failure_is_reported_per_admin() {
        let panel = Arc::new(MockPanel::with_admins(vec![
            panel_admin("alice"),
            panel_admin("bob"),
        ]));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Synchronizer::new(Arc::clone(&panel), Arc::clone(&store))
            .reconcile()
            .await
            .unwrap();
        let (_dir, archive_path) = archive_of(&panel, &store).await;

        // "alice" still exists on the panel (edit path, which we fail);
        // "bob" is gone (create path, which succeeds).
        panel.admins.lock().unwrap().remove("bob");
        *panel.fail_edits.lock().unwrap() =
            Some(PanelError::Transient("panel flapping".to_owned()));

        let executor = RestoreExecutor::new(Arc::clone(&panel), Arc::clone(&store));
        let report = executor.restore(&archive_path).await.unwrap();

        assert_eq!(report.failures(), 1);
        let alice = report.admins.iter().find(|a| a.username == "alice").unwrap();
        assert_eq!(alice.action, RestoreAction::Failed);
        let bob = report.admins.iter().find(|a| a.username == "bob").unwrap();
        assert_eq!(bob.action, RestoreAction::Created);
        assert_eq!(report.local_restored, 2, "local restore still applied");
    }

    #[tokio::test]
    async fn test_recreated_admin_status_restored() {
        let mut disabled = panel_admin("carol");
        disabled.status = AdminStatus::Disabled;
        let panel = Arc::new(MockPanel::with_admins(vec![disabled]));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        Synchronizer::new(Arc::clone(&panel), Arc::clone(&store))
            .reconcile()
            .await
            .unwrap();
        let (_dir, archive_path) = archive_of(&panel, &store).await;

        let report = RestoreExecutor::new(Arc::clone(&panel), Arc::clone(&store))
            .restore(&archive_path)
            .await
            .unwrap();

        assert_eq!(report.failures(), 0);
        assert_eq!(
            store.get("carol").unwrap().unwrap().status,
            AdminStatus::Disabled
        );
    }

    #[test]
    fn test_placeholder_password_is_stable_and_distinct() {
        let a = placeholder_password("abc", "alice");
        let b = placeholder_password("abc", "alice");
        let c = placeholder_password("abc", "bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("restore-"));
    }
}
