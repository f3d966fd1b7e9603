//! Command handler implementation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::types::{AdminCommand, CommandReply, CreateArgs, EditArgs, ExtendArgs};
use crate::backup::{BackupError, BackupScheduler, RestoreAction, RestoreExecutor, list_archives};
use crate::panel::{AdminPatch, AdminSpec, PanelApi};
use crate::store::{AdminRecord, AdminStatus, StateStore};
use crate::sync::Synchronizer;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Handles operator commands against the panel and the backup subsystem.
pub struct CommandHandler<P> {
    /// Command prefix (e.g. "`/panel`").
    prefix: String,

    sync: Arc<Synchronizer<P>>,
    backups: Arc<BackupScheduler<P>>,
    restorer: RestoreExecutor<P>,
    store: Arc<StateStore>,
    backup_dir: PathBuf,
}

impl<P: PanelApi> CommandHandler<P> {
    /// Creates a new command handler.
    #[must_use]
    pub fn new(
        prefix: String,
        panel: Arc<P>,
        store: Arc<StateStore>,
        sync: Arc<Synchronizer<P>>,
        backups: Arc<BackupScheduler<P>>,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            prefix,
            sync,
            backups,
            restorer: RestoreExecutor::new(panel, Arc::clone(&store)),
            store,
            backup_dir,
        }
    }

    /// Tries to parse and execute a command from a message.
    ///
    /// Returns `None` if the message is not a command.
    pub async fn try_handle(&self, message_text: &str) -> Option<CommandReply> {
        let command = AdminCommand::parse(message_text, &self.prefix)?;

        debug!("Handling command: {}", command);
        let reply = self.execute(command).await;
        info!(
            "Command result: success={}, trigger_sync={}",
            reply.success, reply.trigger_sync
        );

        Some(reply)
    }

    /// Executes a parsed command.
    pub async fn execute(&self, command: AdminCommand) -> CommandReply {
        match command {
            AdminCommand::Sync => self.handle_sync().await,
            AdminCommand::Status => self.handle_status(),
            AdminCommand::List => self.handle_list(),
            AdminCommand::View(username) => self.handle_view(&username),
            AdminCommand::Create(args) => self.handle_create(args).await,
            AdminCommand::Delete(username) => self.handle_delete(&username).await,
            AdminCommand::Edit(args) => self.handle_edit(args).await,
            AdminCommand::Disable(username) => self.handle_disable(&username).await,
            AdminCommand::ResetTraffic(username) => self.handle_reset(&username).await,
            AdminCommand::Extend(args) => self.handle_extend(args).await,
            AdminCommand::Backup => self.handle_backup().await,
            AdminCommand::ListBackups => self.handle_list_backups(),
            AdminCommand::Restore(id) => self.handle_restore(&id).await,
            AdminCommand::Help => self.handle_help(),
        }
    }

    async fn handle_sync(&self) -> CommandReply {
        match self.sync.reconcile().await {
            Ok(report) => {
                let mut lines = vec![format!(
                    "Sync finished: {} inserted, {} updated",
                    report.inserted, report.updated
                )];
                if !report.disabled.is_empty() {
                    lines.push(format!("Disabled: {}", report.disabled.join(", ")));
                }
                if !report.orphans.is_empty() {
                    lines.push(format!("Orphaned locally: {}", report.orphans.join(", ")));
                }
                if !report.enforcement_failures.is_empty() {
                    lines.push(format!(
                        "Enforcement failed for: {}",
                        report.enforcement_failures.join(", ")
                    ));
                }
                if report.complete {
                    CommandReply::success(lines.join("\n"))
                } else {
                    lines.push("Pass incomplete, cursor not advanced.".to_owned());
                    CommandReply::error(lines.join("\n"))
                }
            }
            Err(e) => CommandReply::error(format!("Sync failed: {e}")),
        }
    }

    fn handle_status(&self) -> CommandReply {
        let status = match self.sync.status() {
            Ok(status) => status,
            Err(e) => return CommandReply::error(format!("Status unavailable: {e}")),
        };

        let last_sync = status
            .last_sync
            .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339());
        let last_backup = status.last_backup.map_or_else(
            || "never".to_owned(),
            |b| {
                let id = b.archive_id.unwrap_or_else(|| "-".to_owned());
                format!("{} ({}, {})", id, b.status, b.finished_at.to_rfc3339())
            },
        );

        let message = format!(
            "Last sync: {last_sync}\n\
             Admins: {} ({} active, {} disabled, {} expired)\n\
             Last backup: {last_backup}",
            status.admin_count, status.active, status.disabled, status.expired,
        );
        CommandReply::success(message)
    }

    fn handle_list(&self) -> CommandReply {
        let admins = match self.store.list() {
            Ok(admins) => admins,
            Err(e) => return CommandReply::error(format!("Store unavailable: {e}")),
        };

        if admins.is_empty() {
            return CommandReply::error("No admins mirrored. Run 'sync' first.");
        }

        let mut lines = vec!["Mirrored admins:".to_owned()];
        for admin in &admins {
            lines.push(format!(
                "  [{}] {} {} / {}, expires {}",
                admin.status,
                admin.username,
                format_bytes(admin.used_traffic),
                admin.data_limit.map_or_else(|| "unlimited".to_owned(), format_bytes),
                admin
                    .expire_at
                    .map_or_else(|| "never".to_owned(), |t| t.format("%Y-%m-%d").to_string()),
            ));
        }
        CommandReply::success(lines.join("\n"))
    }

    fn handle_view(&self, username: &str) -> CommandReply {
        match self.store.get(username) {
            Ok(Some(admin)) => CommandReply::success(format_admin(&admin)),
            Ok(None) => CommandReply::error(format!(
                "Admin not found: '{username}'. Use 'list' to see mirrored admins."
            )),
            Err(e) => CommandReply::error(format!("Store unavailable: {e}")),
        }
    }

    async fn handle_create(&self, args: CreateArgs) -> CommandReply {
        let data_limit = match args.limit_gb {
            Some(gb) => match gb.checked_mul(BYTES_PER_GB) {
                Some(bytes) => Some(bytes),
                None => return CommandReply::error(format!("Limit out of range: {gb} GB.")),
            },
            None => None,
        };
        let expire_at = match args.expire_days {
            Some(days) => match expiry_in_days(days) {
                Some(t) => Some(t),
                None => return CommandReply::error(format!("Day count out of range: {days}.")),
            },
            None => None,
        };
        let spec = AdminSpec {
            username: args.username,
            password: args.password,
            is_sudo: false,
            data_limit,
            expire_at,
        };
        match self.sync.create_admin(&spec).await {
            Ok(record) => {
                CommandReply::success_with_sync(format!("Created admin '{}'.", record.username))
            }
            Err(e) => CommandReply::error(format!("Create failed: {e}")),
        }
    }

    async fn handle_delete(&self, username: &str) -> CommandReply {
        match self.sync.delete_admin(username).await {
            Ok(()) => CommandReply::success_with_sync(format!("Deleted admin '{username}'.")),
            Err(e) => CommandReply::error(format!("Delete failed: {e}")),
        }
    }

    async fn handle_edit(&self, args: EditArgs) -> CommandReply {
        let patch = match args.field.as_str() {
            "limit" => {
                if args.value.eq_ignore_ascii_case("none") {
                    AdminPatch {
                        data_limit: Some(None),
                        ..AdminPatch::default()
                    }
                } else {
                    let Ok(gb) = args.value.parse::<u64>() else {
                        return CommandReply::error(format!(
                            "Invalid limit '{}': expected gigabytes or 'none'.",
                            args.value
                        ));
                    };
                    let Some(bytes) = gb.checked_mul(BYTES_PER_GB) else {
                        return CommandReply::error(format!("Limit out of range: {gb} GB."));
                    };
                    AdminPatch {
                        data_limit: Some(Some(bytes)),
                        ..AdminPatch::default()
                    }
                }
            }
            "sudo" => match args.value.as_str() {
                "on" | "true" => AdminPatch {
                    is_sudo: Some(true),
                    ..AdminPatch::default()
                },
                "off" | "false" => AdminPatch {
                    is_sudo: Some(false),
                    ..AdminPatch::default()
                },
                other => {
                    return CommandReply::error(format!(
                        "Invalid sudo value '{other}': expected 'on' or 'off'."
                    ));
                }
            },
            "password" => AdminPatch {
                password: Some(args.value.clone()),
                ..AdminPatch::default()
            },
            "status" => match AdminStatus::parse(&args.value) {
                Some(status) => AdminPatch {
                    status: Some(status),
                    ..AdminPatch::default()
                },
                None => {
                    return CommandReply::error(format!(
                        "Invalid status '{}': expected active, disabled, or expired.",
                        args.value
                    ));
                }
            },
            other => {
                return CommandReply::error(format!(
                    "Unknown field '{other}': expected limit, sudo, password, or status."
                ));
            }
        };

        match self.sync.edit_admin(&args.username, &patch).await {
            Ok(_) => CommandReply::success_with_sync(format!(
                "Updated {} for admin '{}'.",
                args.field, args.username
            )),
            Err(e) => CommandReply::error(format!("Edit failed: {e}")),
        }
    }

    async fn handle_disable(&self, username: &str) -> CommandReply {
        match self.sync.edit_admin(username, &AdminPatch::disable()).await {
            Ok(_) => CommandReply::success_with_sync(format!("Disabled admin '{username}'.")),
            Err(e) => CommandReply::error(format!("Disable failed: {e}")),
        }
    }

    async fn handle_reset(&self, username: &str) -> CommandReply {
        match self.sync.reset_traffic(username).await {
            Ok(_) => CommandReply::success_with_sync(format!(
                "Traffic reset for '{username}', account active."
            )),
            Err(e) => CommandReply::error(format!("Reset failed: {e}")),
        }
    }

    async fn handle_extend(&self, args: ExtendArgs) -> CommandReply {
        let new_expiry = match args.days {
            Some(days) => match expiry_in_days(days) {
                Some(t) => Some(t),
                None => return CommandReply::error(format!("Day count out of range: {days}.")),
            },
            None => None,
        };
        match self.sync.extend_expiry(&args.username, new_expiry).await {
            Ok(record) => {
                let until = record
                    .expire_at
                    .map_or_else(|| "never".to_owned(), |t| t.format("%Y-%m-%d").to_string());
                CommandReply::success_with_sync(format!(
                    "Expiry for '{}' set to {until}.",
                    args.username
                ))
            }
            Err(e) => CommandReply::error(format!("Extend failed: {e}")),
        }
    }

    async fn handle_backup(&self) -> CommandReply {
        match self.backups.run_now().await {
            Ok(manifest) => CommandReply::success(format!(
                "Backup complete: {} ({} admins, {}).",
                manifest.id,
                manifest.admin_count,
                format_bytes(manifest.size_bytes),
            )),
            Err(BackupError::AlreadyRunning) => {
                CommandReply::error("A backup is already running.")
            }
            Err(e) => CommandReply::error(format!("Backup failed: {e}")),
        }
    }

    fn handle_list_backups(&self) -> CommandReply {
        let archives = match list_archives(&self.backup_dir) {
            Ok(archives) => archives,
            Err(e) => return CommandReply::error(format!("Cannot list backups: {e}")),
        };

        if archives.is_empty() {
            return CommandReply::error("No backup archives found.");
        }

        let mut lines = vec!["Backup archives (newest first):".to_owned()];
        for info in &archives {
            lines.push(format!("  {} ({})", info.id, format_bytes(info.file_size)));
        }
        CommandReply::success(lines.join("\n"))
    }

    async fn handle_restore(&self, id: &str) -> CommandReply {
        match self.restorer.restore_by_id(&self.backup_dir, id).await {
            Ok(report) => {
                let failures = report.failures();
                let mut lines = vec![format!(
                    "Restored archive {}: {} local records, {} panel admins replayed.",
                    report.archive_id,
                    report.local_restored,
                    report.admins.len(),
                )];
                let created: Vec<_> = report
                    .admins
                    .iter()
                    .filter(|a| a.action == RestoreAction::Created)
                    .map(|a| a.username.as_str())
                    .collect();
                if !created.is_empty() {
                    lines.push(format!(
                        "Recreated with placeholder passwords (rotate them): {}",
                        created.join(", ")
                    ));
                }
                if failures == 0 {
                    CommandReply::success_with_sync(lines.join("\n"))
                } else {
                    for failed in report.admins.iter().filter(|a| a.error.is_some()) {
                        lines.push(format!(
                            "  failed: {} ({})",
                            failed.username,
                            failed.error.as_deref().unwrap_or("unknown"),
                        ));
                    }
                    CommandReply::error(lines.join("\n"))
                }
            }
            Err(e) => CommandReply::error(format!("Restore failed: {e}")),
        }
    }

    fn handle_help(&self) -> CommandReply {
        let mut lines = vec![format!("Available commands (prefix: {}):", self.prefix)];
        for (name, aliases, description) in AdminCommand::all_commands() {
            if aliases.is_empty() {
                lines.push(format!("  {name} - {description}"));
            } else {
                lines.push(format!("  {name} {aliases} - {description}"));
            }
        }
        CommandReply::success(lines.join("\n"))
    }
}

impl<P> std::fmt::Debug for CommandHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn format_admin(admin: &AdminRecord) -> String {
    format!(
        "Admin '{}':\n\
         Status: {}\n\
         Sudo: {}\n\
         Traffic: {} / {}\n\
         Expires: {}\n\
         Synced: {}",
        admin.username,
        admin.status,
        if admin.is_sudo { "yes" } else { "no" },
        format_bytes(admin.used_traffic),
        admin.data_limit.map_or_else(|| "unlimited".to_owned(), format_bytes),
        admin
            .expire_at
            .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339()),
        admin.synced_at.to_rfc3339(),
    )
}

/// Turns a relative day count into an expiry timestamp.
///
/// `None` when the count exceeds what the calendar can represent.
fn expiry_in_days(days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|d| Utc::now().checked_add_signed(d))
}

/// Renders a byte count with a binary unit suffix.
#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    let value = bytes as f64;
    if bytes >= BYTES_PER_GB {
        format!("{:.2} GB", value / BYTES_PER_GB as f64)
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", value / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", value / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPanel, panel_admin};
    use std::time::Duration as StdDuration;

    fn handler(panel: Arc<MockPanel>, dir: &std::path::Path) -> CommandHandler<MockPanel> {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let sync = Arc::new(Synchronizer::new(Arc::clone(&panel), Arc::clone(&store)));
        let backups = Arc::new(BackupScheduler::new(
            Arc::clone(&panel),
            Arc::clone(&store),
            dir.to_path_buf(),
            StdDuration::from_secs(3600),
            5,
        ));
        CommandHandler::new(
            "/panel".to_owned(),
            panel,
            store,
            sync,
            backups,
            dir.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn test_non_command_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Arc::new(MockPanel::default()), dir.path());
        assert!(handler.try_handle("hello there").await.is_none());
    }

    #[tokio::test]
    async fn test_sync_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::with_admins(vec![panel_admin("alice")]));
        let handler = handler(panel, dir.path());

        let reply = handler.try_handle("/panel sync").await.unwrap();
        assert!(reply.success, "{}", reply.message);

        let reply = handler.try_handle("/panel list").await.unwrap();
        assert!(reply.success);
        assert!(reply.message.contains("alice"));
    }

    #[tokio::test]
    async fn test_create_requests_followup_sync() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::default());
        let handler = handler(Arc::clone(&panel), dir.path());

        let reply = handler
            .try_handle("/panel create bob secret 10 30")
            .await
            .unwrap();
        assert!(reply.success, "{}", reply.message);
        assert!(reply.trigger_sync);

        let admins = panel.admins.lock().unwrap();
        let bob = admins.get("bob").unwrap();
        assert_eq!(bob.data_limit, Some(10 * BYTES_PER_GB));
    }

    #[tokio::test]
    async fn test_backup_then_list_backups() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::with_admins(vec![panel_admin("alice")]));
        let handler = handler(panel, dir.path());

        let reply = handler.try_handle("/panel backup").await.unwrap();
        assert!(reply.success, "{}", reply.message);

        let reply = handler.try_handle("/panel backups").await.unwrap();
        assert!(reply.success);
        assert!(reply.message.contains("Backup archives"));
    }

    #[tokio::test]
    async fn test_edit_limit_in_gigabytes() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::with_admins(vec![panel_admin("alice")]));
        let handler = handler(Arc::clone(&panel), dir.path());

        let reply = handler.try_handle("/panel edit alice limit 2").await.unwrap();
        assert!(reply.success, "{}", reply.message);

        let admins = panel.admins.lock().unwrap();
        assert_eq!(admins.get("alice").unwrap().data_limit, Some(2 * BYTES_PER_GB));
    }

    #[tokio::test]
    async fn test_edit_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Arc::new(MockPanel::default()), dir.path());

        let reply = handler
            .try_handle("/panel edit alice quota 2")
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("Unknown field"));
    }

    #[tokio::test]
    async fn test_extend_huge_day_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::with_admins(vec![panel_admin("alice")]));
        let handler = handler(panel, dir.path());

        let reply = handler
            .try_handle("/panel extend alice 99999999999999999")
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("out of range"));
    }

    #[tokio::test]
    async fn test_create_huge_day_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::default());
        let handler = handler(Arc::clone(&panel), dir.path());

        let reply = handler
            .try_handle("/panel create bob secret - 99999999999999999")
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("out of range"));
        assert!(panel.admins.lock().unwrap().is_empty(), "no remote create issued");
    }

    #[tokio::test]
    async fn test_view_unknown_admin() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Arc::new(MockPanel::default()), dir.path());

        let reply = handler.try_handle("/panel view ghost").await.unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_failed_delete_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(MockPanel::default());
        *panel.fail_next.lock().unwrap() = Some(crate::panel::PanelError::Transient(
            "connection refused".to_owned(),
        ));
        let handler = handler(panel, dir.path());

        let reply = handler.try_handle("/panel delete alice").await.unwrap();
        assert!(!reply.success);
        assert!(reply.message.contains("Delete failed"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(10 * BYTES_PER_GB), "10.00 GB");
    }
}
