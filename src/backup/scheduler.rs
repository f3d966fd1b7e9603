//! Recurring backup runner.
//!
//! State machine per run: Idle -> Running -> {Succeeded, Failed}. A timer
//! fires every configured interval; only one run may be active at a time.
//! A tick that lands while a run is still active is dropped and logged as a
//! skipped cycle, not an error. A failed run records its reason and the next
//! scheduled run proceeds normally.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::archive::{Archive, ArchiveError, Manifest, prune_archives};
use crate::panel::{PanelApi, PanelError};
use crate::store::{BackupBookkeeping, StateStore, StoreError};

/// Errors surfaced by a backup run.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A backup run is already active")]
    AlreadyRunning,
}

/// Messages that can be sent to the scheduler.
#[derive(Debug, Clone)]
pub enum BackupMessage {
    /// Run a backup immediately (operator-triggered).
    TriggerBackup,
    /// Stop the scheduler.
    Shutdown,
}

/// Recurring backup scheduler.
pub struct BackupScheduler<P> {
    panel: Arc<P>,
    store: Arc<StateStore>,

    /// Directory receiving archives.
    backup_dir: PathBuf,

    /// Interval between scheduled runs.
    run_interval: Duration,

    /// How many archives to keep after a successful run.
    retention: usize,

    /// Held for the duration of a run; `try_lock` failure means a run is
    /// active and the trigger is dropped.
    run_guard: Mutex<()>,

    /// Ticks dropped because a run was still active.
    skipped_cycles: AtomicU64,
}

impl<P: PanelApi> BackupScheduler<P> {
    /// Creates a backup scheduler.
    #[must_use]
    pub fn new(
        panel: Arc<P>,
        store: Arc<StateStore>,
        backup_dir: PathBuf,
        run_interval: Duration,
        retention: usize,
    ) -> Self {
        Self {
            panel,
            store,
            backup_dir,
            run_interval,
            retention,
            run_guard: Mutex::new(()),
            skipped_cycles: AtomicU64::new(0),
        }
    }

    /// Number of ticks dropped so far because a run was active.
    #[must_use]
    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles.load(Ordering::Relaxed)
    }

    /// Runs the scheduler loop until shutdown.
    ///
    /// A tick that elapses while a run is still active is dropped, never
    /// queued: the timer skips missed ticks instead of bursting them once
    /// the run finishes.
    pub async fn run(&self, mut rx: mpsc::Receiver<BackupMessage>) {
        info!(
            "Backup scheduler started (every {:?}, retention {})",
            self.run_interval, self.retention
        );

        let mut timer = interval(self.run_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval completes immediately; consume
        // it so the first backup happens one full interval after startup.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.tick().await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(BackupMessage::TriggerBackup) => {
                            debug!("Received manual backup trigger");
                            self.tick().await;
                        }
                        Some(BackupMessage::Shutdown) | None => {
                            info!("Backup scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Single scheduler tick: runs a backup unless one is already active.
    async fn tick(&self) {
        let Ok(_guard) = self.run_guard.try_lock() else {
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            info!("Backup run still active, skipping this cycle");
            return;
        };

        match self.perform_run().await {
            Ok(manifest) => {
                info!("Backup run succeeded: archive {}", manifest.id);
            }
            Err(e) => {
                error!("Backup run failed: {}", e);
                self.record_outcome(None, "failed", Some(e.to_string()));
            }
        }
    }

    /// Runs a backup immediately, failing if one is already active.
    ///
    /// Used by the operator-facing `triggerBackupNow` command path when the
    /// caller needs the manifest rather than a fire-and-forget trigger.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if a run is active, or the failing step's
    /// error otherwise.
    pub async fn run_now(&self) -> Result<Manifest, BackupError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return Err(BackupError::AlreadyRunning);
        };
        let result = self.perform_run().await;
        if let Err(e) = &result {
            self.record_outcome(None, "failed", Some(e.to_string()));
        }
        result
    }

    /// One backup run: snapshot, export, bundle, write, prune.
    async fn perform_run(&self) -> Result<Manifest, BackupError> {
        let started = Utc::now();
        debug!("Backup run starting");

        // Snapshot the store into a scratch dir; the store lock is held only
        // for the instant of the VACUUM INTO.
        let scratch = tempfile::tempdir()?;
        let snapshot_path = scratch.path().join("state_snapshot.db");
        self.store.snapshot_to(&snapshot_path)?;
        let snapshot = std::fs::read(&snapshot_path)?;

        let export = self.panel.export_state().await?;

        let archive = Archive::build(started, &snapshot, export)?;
        archive.write_atomic(&self.backup_dir)?;
        let manifest = archive.manifest;

        match prune_archives(&self.backup_dir, self.retention) {
            Ok(pruned) if pruned > 0 => debug!("Retention pruned {} archive(s)", pruned),
            Ok(_) => {}
            Err(e) => warn!("Retention pruning failed: {}", e),
        }

        self.record_outcome(Some(manifest.id.clone()), "complete", None);
        Ok(manifest)
    }

    /// Bookkeeping write; failures here must not fail the run itself.
    fn record_outcome(&self, archive_id: Option<String>, status: &str, reason: Option<String>) {
        let entry = BackupBookkeeping {
            archive_id,
            finished_at: Utc::now(),
            status: status.to_owned(),
            reason,
        };
        if let Err(e) = self.store.set_last_backup(&entry) {
            warn!("Failed to record backup outcome: {}", e);
        }
    }
}

impl<P> std::fmt::Debug for BackupScheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("backup_dir", &self.backup_dir)
            .field("run_interval", &self.run_interval)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
