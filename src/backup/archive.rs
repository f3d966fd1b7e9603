//! Archive file format, integrity checking and retention pruning.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::panel::PanelExport;

/// File extension for backup archives.
pub const ARCHIVE_EXT: &str = "archive";

/// Archive errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("An archive with id {0} already exists")]
    Duplicate(String),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Describes an archive's contents; verified on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Timestamp-derived identifier, e.g. `20260829_143000`.
    pub id: String,

    /// When the archive was created.
    pub created_at: DateTime<Utc>,

    /// SHA-256 over the raw snapshot bytes followed by the export JSON.
    pub checksum: String,

    /// Number of admins in the panel export.
    pub admin_count: usize,

    /// Combined payload size in bytes before encoding.
    pub size_bytes: u64,
}

/// A point-in-time bundle of local and panel state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub manifest: Manifest,

    /// Base64-encoded SQLite snapshot of the local state store.
    pub db_snapshot: String,

    /// Panel export taken at archive time.
    pub panel_export: PanelExport,
}

/// Derives an archive identifier from a timestamp.
#[must_use]
pub fn archive_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

fn checksum_over(snapshot: &[u8], export_json: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot);
    hasher.update(export_json);
    format!("{:x}", hasher.finalize())
}

impl Archive {
    /// Bundles a database snapshot and a panel export into an archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the export cannot be serialized.
    pub fn build(
        created_at: DateTime<Utc>,
        snapshot: &[u8],
        panel_export: PanelExport,
    ) -> ArchiveResult<Self> {
        let export_json = serde_json::to_vec(&panel_export)?;
        let checksum = checksum_over(snapshot, &export_json);

        Ok(Self {
            manifest: Manifest {
                id: archive_id(created_at),
                created_at,
                checksum,
                admin_count: panel_export.admins.len(),
                size_bytes: (snapshot.len() + export_json.len()) as u64,
            },
            db_snapshot: BASE64.encode(snapshot),
            panel_export,
        })
    }

    /// Writes the archive to `{dir}/{id}.archive` atomically.
    ///
    /// The content goes to a temp file in the same directory first and is
    /// renamed into place, so a crash mid-write never leaves a corrupt
    /// archive visible.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` if an archive with this id already exists
    /// (ids have one-second resolution), or an error if serialization or
    /// any filesystem step fails.
    pub fn write_atomic(&self, dir: impl AsRef<Path>) -> ArchiveResult<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let final_path = dir.join(format!("{}.{ARCHIVE_EXT}", self.manifest.id));
        if final_path.exists() {
            return Err(ArchiveError::Duplicate(self.manifest.id.clone()));
        }
        let json = serde_json::to_vec(self)?;

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), &json)?;
        tmp.persist_noclobber(&final_path).map_err(|e| e.error)?;

        info!(
            "Archive {} written ({} admins, {} payload bytes)",
            self.manifest.id, self.manifest.admin_count, self.manifest.size_bytes
        );
        Ok(final_path)
    }

    /// Loads an archive from disk without validating it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist, or a parse error.
    pub fn load(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArchiveError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Verifies checksum and manifest consistency.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` on any mismatch; callers must not apply the archive.
    pub fn validate(&self) -> ArchiveResult<()> {
        let snapshot = self.snapshot_bytes()?;
        let export_json = serde_json::to_vec(&self.panel_export)?;

        let actual = checksum_over(&snapshot, &export_json);
        if actual != self.manifest.checksum {
            return Err(ArchiveError::Corrupt(format!(
                "checksum mismatch: manifest {} != computed {actual}",
                self.manifest.checksum
            )));
        }
        if self.manifest.admin_count != self.panel_export.admins.len() {
            return Err(ArchiveError::Corrupt(format!(
                "manifest admin count {} != export count {}",
                self.manifest.admin_count,
                self.panel_export.admins.len()
            )));
        }
        Ok(())
    }

    /// Decodes the embedded database snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the embedded blob is not valid base64.
    pub fn snapshot_bytes(&self) -> ArchiveResult<Vec<u8>> {
        BASE64
            .decode(&self.db_snapshot)
            .map_err(|e| ArchiveError::Corrupt(format!("snapshot encoding: {e}")))
    }
}

/// Listing entry for an archive on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub file_size: u64,
}

/// Lists archives in a directory, newest first.
///
/// Entries whose name does not parse as an archive id are skipped.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_archives(dir: impl AsRef<Path>) -> ArchiveResult<Vec<ArchiveInfo>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT) {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(naive) = NaiveDateTime::parse_from_str(id, "%Y%m%d_%H%M%S") else {
            debug!("Skipping non-archive file {}", path.display());
            continue;
        };
        archives.push(ArchiveInfo {
            id: id.to_owned(),
            path: path.clone(),
            created_at: naive.and_utc(),
            file_size: entry.metadata()?.len(),
        });
    }

    archives.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(archives)
}

/// Deletes the oldest archives beyond `keep`.
///
/// # Errors
///
/// Returns an error if listing or deletion fails.
pub fn prune_archives(dir: impl AsRef<Path>, keep: usize) -> ArchiveResult<usize> {
    let archives = list_archives(&dir)?;
    if archives.len() <= keep {
        return Ok(0);
    }

    let mut pruned = 0;
    for old in &archives[keep..] {
        std::fs::remove_file(&old.path)?;
        info!("Pruned archive {}", old.id);
        pruned += 1;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn export() -> PanelExport {
        PanelExport {
            fetched_at: Utc::now(),
            admins: vec![crate::testing::panel_admin("alice")],
            system: serde_json::json!({"version": "test"}),
        }
    }

    fn stamp(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, 12, 0, secs).unwrap()
    }

    #[test]
    fn test_build_and_validate() {
        let archive = Archive::build(stamp(0), b"snapshot bytes", export()).unwrap();
        assert_eq!(archive.manifest.id, "20260829_120000");
        assert_eq!(archive.manifest.admin_count, 1);
        archive.validate().unwrap();
    }

    #[test]
    fn test_tampered_snapshot_detected() {
        let mut archive = Archive::build(stamp(0), b"snapshot bytes", export()).unwrap();
        archive.db_snapshot = BASE64.encode(b"tampered");
        assert!(matches!(archive.validate(), Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn test_tampered_manifest_count_detected() {
        let mut archive = Archive::build(stamp(0), b"snapshot bytes", export()).unwrap();
        archive.manifest.admin_count = 99;
        assert!(matches!(archive.validate(), Err(ArchiveError::Corrupt(_))));
    }

    #[test]
    fn test_write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::build(stamp(0), b"snapshot bytes", export()).unwrap();
        let path = archive.write_atomic(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("20260829_120000.archive"));

        let loaded = Archive::load(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.manifest, archive.manifest);
        assert_eq!(loaded.snapshot_bytes().unwrap(), b"snapshot bytes");
    }

    #[test]
    fn test_same_second_id_is_rejected_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let first = Archive::build(stamp(0), b"first", export()).unwrap();
        let path = first.write_atomic(dir.path()).unwrap();

        let second = Archive::build(stamp(0), b"second", export()).unwrap();
        assert!(matches!(
            second.write_atomic(dir.path()),
            Err(ArchiveError::Duplicate(_))
        ));
        assert_eq!(
            Archive::load(&path).unwrap().snapshot_bytes().unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_load_missing_is_not_found() {
        assert!(matches!(
            Archive::load("/nonexistent/x.archive"),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_skips_foreign_files_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for secs in [2, 0, 1] {
            Archive::build(stamp(secs), b"x", export())
                .unwrap()
                .write_atomic(dir.path())
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join("weird.archive"), "bad name").unwrap();

        let listed = list_archives(dir.path()).unwrap();
        let ids: Vec<_> = listed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["20260829_120002", "20260829_120001", "20260829_120000"]
        );
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        assert!(list_archives("/nonexistent/backups").unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for secs in 0..4 {
            Archive::build(stamp(secs), b"x", export())
                .unwrap()
                .write_atomic(dir.path())
                .unwrap();
        }

        let pruned = prune_archives(dir.path(), 3).unwrap();
        assert_eq!(pruned, 1);

        let ids: Vec<_> = list_archives(dir.path())
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(
            ids,
            vec!["20260829_120003", "20260829_120002", "20260829_120001"],
            "oldest archive pruned first"
        );
    }

    #[test]
    fn test_prune_under_limit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        Archive::build(stamp(0), b"x", export())
            .unwrap()
            .write_atomic(dir.path())
            .unwrap();
        assert_eq!(prune_archives(dir.path(), 3).unwrap(), 0);
    }
}
