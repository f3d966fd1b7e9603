//! Backup subsystem: point-in-time archives of panel and local state.
//!
//! An archive is a single `{backup_dir}/{timestamp}.archive` file bundling a
//! manifest, the embedded database snapshot and the panel export. Archives
//! are written atomically (temp file, then rename) and pruned by retention.

mod archive;
mod restore;
mod scheduler;

pub use archive::{Archive, ArchiveError, ArchiveInfo, Manifest, list_archives, prune_archives};
pub use restore::{AdminApplyResult, RestoreAction, RestoreError, RestoreExecutor, RestoreReport};
pub use scheduler::{BackupError, BackupMessage, BackupScheduler};
