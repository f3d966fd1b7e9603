//! Command types and definitions.

use std::fmt;

/// Arguments for creating a new admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    pub username: String,
    pub password: String,
    /// Traffic quota in whole gigabytes; `None` means unlimited.
    pub limit_gb: Option<u64>,
    /// Days until expiry; `None` means never.
    pub expire_days: Option<i64>,
}

/// Arguments for editing one field of an existing admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditArgs {
    pub username: String,
    /// Field to change: `limit`, `sudo`, `password`, or `status`.
    pub field: String,
    pub value: String,
}

/// Arguments for moving an admin's expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendArgs {
    pub username: String,
    /// Days from now; `None` clears the expiry entirely.
    pub days: Option<i64>,
}

/// Available panel commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Run a reconciliation pass immediately.
    Sync,

    /// Show sync status, admin counts, and the last backup.
    Status,

    /// List all mirrored admins.
    List,

    /// Show detailed view of a specific admin.
    View(String),

    /// Create a panel admin.
    Create(CreateArgs),

    /// Delete a panel admin.
    Delete(String),

    /// Change one field of a panel admin.
    Edit(EditArgs),

    /// Disable a panel admin.
    Disable(String),

    /// Zero an admin's traffic counter and reactivate.
    ResetTraffic(String),

    /// Move an admin's expiry.
    Extend(ExtendArgs),

    /// Run a backup immediately.
    Backup,

    /// List stored backup archives.
    ListBackups,

    /// Restore a backup archive by id.
    Restore(String),

    /// Show help information.
    Help,
}

impl AdminCommand {
    /// Parses a command from a message text.
    ///
    /// Returns `None` if the message is not a valid command.
    #[must_use]
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        let text = text.trim();

        if !text.starts_with(prefix) {
            return None;
        }

        let after_prefix = text[prefix.len()..].trim_start();

        let (cmd, args) = match after_prefix.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd.to_lowercase(), Some(args.trim())),
            None => (after_prefix.to_lowercase(), None),
        };

        match cmd.as_str() {
            "sync" | "reconcile" => Some(Self::Sync),
            "status" | "stat" | "s" => Some(Self::Status),
            "list" | "admins" | "ls" => Some(Self::List),
            "view" | "show" => args
                .filter(|a| !a.is_empty())
                .map(|a| Self::View(a.to_owned())),
            "create" | "add" => Self::parse_create(args?),
            "delete" | "remove" | "rm" => args
                .filter(|a| !a.is_empty())
                .map(|a| Self::Delete(a.to_owned())),
            "edit" | "set" => Self::parse_edit(args?),
            "disable" | "off" => args
                .filter(|a| !a.is_empty())
                .map(|a| Self::Disable(a.to_owned())),
            "reset" | "reset_traffic" => args
                .filter(|a| !a.is_empty())
                .map(|a| Self::ResetTraffic(a.to_owned())),
            "extend" | "expiry" => Self::parse_extend(args?),
            "backup" | "backup_now" => Some(Self::Backup),
            "backups" | "list_backups" => Some(Self::ListBackups),
            "restore" => args
                .filter(|a| !a.is_empty())
                .map(|a| Self::Restore(a.to_owned())),
            "help" | "h" | "?" => Some(Self::Help),
            _ => None,
        }
    }

    /// Parses create command arguments: `<username> <password> [limit_gb] [days]`
    fn parse_create(args: &str) -> Option<Self> {
        let mut parts = args.split_whitespace();
        let username = parts.next()?.to_owned();
        let password = parts.next()?.to_owned();

        let limit_gb = match parts.next() {
            Some("-") | None => None,
            Some(raw) => Some(raw.parse().ok()?),
        };
        let expire_days = match parts.next() {
            Some("-") | None => None,
            Some(raw) => Some(raw.parse().ok()?),
        };

        if username.is_empty() || password.is_empty() {
            return None;
        }

        Some(Self::Create(CreateArgs {
            username,
            password,
            limit_gb,
            expire_days,
        }))
    }

    /// Parses edit command arguments: `<username> <field> <value>`
    fn parse_edit(args: &str) -> Option<Self> {
        let mut parts = args.split_whitespace();
        let username = parts.next()?.to_owned();
        let field = parts.next()?.to_lowercase();
        let value = parts.next()?.to_owned();

        Some(Self::Edit(EditArgs {
            username,
            field,
            value,
        }))
    }

    /// Parses extend command arguments: `<username> <days|never>`
    fn parse_extend(args: &str) -> Option<Self> {
        let mut parts = args.split_whitespace();
        let username = parts.next()?.to_owned();
        let days_str = parts.next()?;

        let days = if days_str.eq_ignore_ascii_case("never") {
            None
        } else {
            Some(days_str.parse().ok()?)
        };

        Some(Self::Extend(ExtendArgs { username, days }))
    }

    /// Returns the command name as it appears in help.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Status => "status",
            Self::List => "list",
            Self::View(_) => "view",
            Self::Create(_) => "create",
            Self::Delete(_) => "delete",
            Self::Edit(_) => "edit",
            Self::Disable(_) => "disable",
            Self::ResetTraffic(_) => "reset",
            Self::Extend(_) => "extend",
            Self::Backup => "backup",
            Self::ListBackups => "backups",
            Self::Restore(_) => "restore",
            Self::Help => "help",
        }
    }

    /// Returns all available commands with their descriptions.
    #[must_use]
    pub fn all_commands() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("sync", "", "Run a reconciliation pass now"),
            ("status", "(s)", "Show sync status and admin counts"),
            ("list", "(ls)", "List mirrored admins"),
            ("view <username>", "", "Show details of one admin"),
            (
                "create <user> <pass> [gb] [days]",
                "",
                "Create an admin ('-' skips a field)",
            ),
            ("delete <username>", "(rm)", "Delete an admin"),
            (
                "edit <username> <field> <value>",
                "",
                "Change limit, sudo, password, or status",
            ),
            ("disable <username>", "", "Disable an admin"),
            ("reset <username>", "", "Zero traffic and reactivate"),
            ("extend <username> <days|never>", "", "Move an admin's expiry"),
            ("backup", "", "Run a backup now"),
            ("backups", "", "List stored backup archives"),
            ("restore <id>", "", "Restore a backup archive"),
            ("help", "(h, ?)", "Show this help message"),
        ]
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::View(username) => write!(f, "view {username}"),
            Self::Create(args) => write!(f, "create {}", args.username),
            Self::Delete(username) => write!(f, "delete {username}"),
            Self::Edit(args) => write!(f, "edit {} {}", args.username, args.field),
            Self::Disable(username) => write!(f, "disable {username}"),
            Self::ResetTraffic(username) => write!(f, "reset {username}"),
            Self::Extend(args) => write!(f, "extend {}", args.username),
            Self::Restore(id) => write!(f, "restore {id}"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Result of command execution.
#[derive(Debug, Clone)]
pub struct CommandReply {
    /// Whether the command was successful.
    pub success: bool,

    /// Response message to show the operator.
    pub message: String,

    /// Whether to trigger an immediate reconciliation pass.
    pub trigger_sync: bool,
}

impl CommandReply {
    /// Creates a successful result.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            trigger_sync: false,
        }
    }

    /// Creates a successful result that triggers a reconciliation.
    #[must_use]
    pub fn success_with_sync(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            trigger_sync: true,
        }
    }

    /// Creates an error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            trigger_sync: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "/panel";

    #[test]
    fn test_parse_sync() {
        assert_eq!(
            AdminCommand::parse("/panel sync", PREFIX),
            Some(AdminCommand::Sync)
        );
        assert_eq!(
            AdminCommand::parse("/panel reconcile", PREFIX),
            Some(AdminCommand::Sync)
        );
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(
            AdminCommand::parse("/panel status", PREFIX),
            Some(AdminCommand::Status)
        );
        assert_eq!(
            AdminCommand::parse("/panel s", PREFIX),
            Some(AdminCommand::Status)
        );
    }

    #[test]
    fn test_parse_create_full() {
        assert_eq!(
            AdminCommand::parse("/panel create alice hunter2 50 30", PREFIX),
            Some(AdminCommand::Create(CreateArgs {
                username: "alice".to_owned(),
                password: "hunter2".to_owned(),
                limit_gb: Some(50),
                expire_days: Some(30),
            }))
        );
    }

    #[test]
    fn test_parse_create_skipped_quota() {
        assert_eq!(
            AdminCommand::parse("/panel create alice hunter2 - 30", PREFIX),
            Some(AdminCommand::Create(CreateArgs {
                username: "alice".to_owned(),
                password: "hunter2".to_owned(),
                limit_gb: None,
                expire_days: Some(30),
            }))
        );
    }

    #[test]
    fn test_parse_create_missing_password() {
        assert_eq!(AdminCommand::parse("/panel create alice", PREFIX), None);
    }

    #[test]
    fn test_parse_edit() {
        assert_eq!(
            AdminCommand::parse("/panel edit alice limit 100", PREFIX),
            Some(AdminCommand::Edit(EditArgs {
                username: "alice".to_owned(),
                field: "limit".to_owned(),
                value: "100".to_owned(),
            }))
        );
        assert_eq!(AdminCommand::parse("/panel edit alice limit", PREFIX), None);
    }

    #[test]
    fn test_parse_extend_never() {
        assert_eq!(
            AdminCommand::parse("/panel extend alice never", PREFIX),
            Some(AdminCommand::Extend(ExtendArgs {
                username: "alice".to_owned(),
                days: None,
            }))
        );
    }

    #[test]
    fn test_parse_extend_days() {
        assert_eq!(
            AdminCommand::parse("/panel extend alice 14", PREFIX),
            Some(AdminCommand::Extend(ExtendArgs {
                username: "alice".to_owned(),
                days: Some(14),
            }))
        );
    }

    #[test]
    fn test_parse_delete() {
        assert_eq!(
            AdminCommand::parse("/panel delete alice", PREFIX),
            Some(AdminCommand::Delete("alice".to_owned()))
        );
        assert_eq!(
            AdminCommand::parse("/panel rm alice", PREFIX),
            Some(AdminCommand::Delete("alice".to_owned()))
        );
    }

    #[test]
    fn test_parse_restore_without_id() {
        assert_eq!(AdminCommand::parse("/panel restore", PREFIX), None);
    }

    #[test]
    fn test_parse_wrong_prefix() {
        assert_eq!(AdminCommand::parse("/other sync", PREFIX), None);
        assert_eq!(AdminCommand::parse("sync", PREFIX), None);
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(
            AdminCommand::parse("/panel SYNC", PREFIX),
            Some(AdminCommand::Sync)
        );
    }

    #[test]
    fn test_parse_with_extra_whitespace() {
        assert_eq!(
            AdminCommand::parse("  /panel   backup  ", PREFIX),
            Some(AdminCommand::Backup)
        );
    }
}
