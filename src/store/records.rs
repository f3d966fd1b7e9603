//! Admin record shape and SQLite row mapping.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an admin account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    Active,
    Disabled,
    Expired,
}

impl AdminStatus {
    /// Stable string form used in the database and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Expired => "expired",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdminStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mirrored panel admin account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRecord {
    /// Unique panel username.
    pub username: String,

    /// Whether the admin has sudo privileges on the panel.
    pub is_sudo: bool,

    /// Traffic quota in bytes; `None` means unlimited.
    pub data_limit: Option<u64>,

    /// Traffic consumed in bytes. Monotonic until a reset.
    pub used_traffic: u64,

    /// Expiry timestamp; `None` means never.
    pub expire_at: Option<DateTime<Utc>>,

    /// Current lifecycle status.
    pub status: AdminStatus,

    /// When this record was last synchronized with the panel.
    pub synced_at: DateTime<Utc>,
}

impl AdminRecord {
    /// True when used traffic has reached or exceeded the quota.
    #[must_use]
    pub fn over_quota(&self) -> bool {
        self.data_limit
            .is_some_and(|limit| self.used_traffic >= limit)
    }

    /// True when the expiry timestamp is in the past relative to `now`.
    #[must_use]
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|expiry| expiry < now)
    }

    /// True when the record requires a disable instruction: either the quota
    /// is exhausted or the expiry has passed while the record is active.
    #[must_use]
    pub fn needs_enforcement(&self, now: DateTime<Utc>) -> bool {
        self.status == AdminStatus::Active && (self.over_quota() || self.expired_at(now))
    }
}

fn parse_datetime(raw: &str, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
        })
}

/// Maps an `admins` row (in schema column order) to a record.
pub(super) fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AdminRecord> {
    let status_raw: String = row.get(5)?;
    let status = AdminStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Text,
            format!("unknown admin status: {status_raw}").into(),
        )
    })?;

    let expire_at: Option<String> = row.get(4)?;
    let expire_at = match expire_at {
        Some(raw) => Some(parse_datetime(&raw, 4)?),
        None => None,
    };

    let synced_raw: String = row.get(6)?;

    let data_limit: Option<i64> = row.get(2)?;
    let used_traffic: i64 = row.get(3)?;

    Ok(AdminRecord {
        username: row.get(0)?,
        is_sudo: row.get(1)?,
        data_limit: data_limit.map(i64::unsigned_abs),
        used_traffic: used_traffic.unsigned_abs(),
        expire_at,
        status,
        synced_at: parse_datetime(&synced_raw, 6)?,
    })
}

/// Upserts a record inside an already-open transaction.
pub(super) fn upsert_in_tx(conn: &Connection, record: &AdminRecord) -> rusqlite::Result<()> {
    #[allow(clippy::cast_possible_wrap)]
    conn.execute(
        "INSERT INTO admins (username, is_sudo, data_limit, used_traffic, expire_at, status, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(username) DO UPDATE SET
            is_sudo = excluded.is_sudo,
            data_limit = excluded.data_limit,
            used_traffic = excluded.used_traffic,
            expire_at = excluded.expire_at,
            status = excluded.status,
            synced_at = excluded.synced_at",
        params![
            record.username,
            record.is_sudo,
            record.data_limit.map(|v| v as i64),
            record.used_traffic as i64,
            record.expire_at.map(|t| t.to_rfc3339()),
            record.status.as_str(),
            record.synced_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> AdminRecord {
        AdminRecord {
            username: "alice".to_owned(),
            is_sudo: false,
            data_limit: Some(100),
            used_traffic: 0,
            expire_at: None,
            status: AdminStatus::Active,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [AdminStatus::Active, AdminStatus::Disabled, AdminStatus::Expired] {
            assert_eq!(AdminStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AdminStatus::parse("banana"), None);
    }

    #[test]
    fn test_over_quota() {
        let mut r = record();
        assert!(!r.over_quota());

        r.used_traffic = 100;
        assert!(r.over_quota());

        r.data_limit = None;
        assert!(!r.over_quota(), "unlimited quota is never exceeded");
    }

    #[test]
    fn test_expired_at() {
        let now = Utc::now();
        let mut r = record();
        assert!(!r.expired_at(now), "no expiry means never expired");

        r.expire_at = Some(now - Duration::hours(1));
        assert!(r.expired_at(now));

        r.expire_at = Some(now + Duration::hours(1));
        assert!(!r.expired_at(now));
    }

    #[test]
    fn test_needs_enforcement_only_when_active() {
        let now = Utc::now();
        let mut r = record();
        r.used_traffic = 100;
        assert!(r.needs_enforcement(now));

        r.status = AdminStatus::Disabled;
        assert!(!r.needs_enforcement(now), "already disabled, nothing to do");
    }
}
