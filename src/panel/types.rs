//! Wire types for the panel API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::AdminStatus;

/// Admin account as reported by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelAdmin {
    /// Unique panel username.
    pub username: String,

    /// Whether the admin has sudo privileges.
    #[serde(default)]
    pub is_sudo: bool,

    /// Traffic quota in bytes; `None` means unlimited.
    #[serde(default)]
    pub data_limit: Option<u64>,

    /// Traffic consumed in bytes.
    #[serde(default)]
    pub used_traffic: u64,

    /// Expiry timestamp; `None` means never.
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,

    /// Account status as tracked by the panel.
    #[serde(default = "default_status")]
    pub status: AdminStatus,
}

const fn default_status() -> AdminStatus {
    AdminStatus::Active
}

/// Specification for creating an admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSpec {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_sudo: bool,
    #[serde(default)]
    pub data_limit: Option<u64>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Partial update applied to an existing admin.
///
/// `None` fields are omitted from the request body and left untouched by the
/// panel. Clearing a nullable field (quota, expiry) goes through the
/// double-`Option` form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sudo: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_limit: Option<Option<u64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_traffic: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<Option<DateTime<Utc>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdminStatus>,
}

impl AdminPatch {
    /// A patch that disables the account.
    #[must_use]
    pub fn disable() -> Self {
        Self {
            status: Some(AdminStatus::Disabled),
            ..Self::default()
        }
    }

    /// A patch that zeroes the used-traffic counter and reactivates.
    #[must_use]
    pub fn reset_traffic() -> Self {
        Self {
            used_traffic: Some(0),
            status: Some(AdminStatus::Active),
            ..Self::default()
        }
    }

    /// A patch that moves the expiry to a new timestamp.
    #[must_use]
    pub fn extend_expiry(new_expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            expire_at: Some(new_expiry),
            ..Self::default()
        }
    }

    /// True when the patch carries no changes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.is_sudo.is_none()
            && self.data_limit.is_none()
            && self.used_traffic.is_none()
            && self.expire_at.is_none()
            && self.status.is_none()
    }
}

/// Point-in-time export of panel state, embedded into backup archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelExport {
    /// When the export was taken.
    pub fetched_at: DateTime<Utc>,

    /// Full admin list at export time.
    pub admins: Vec<PanelAdmin>,

    /// Raw system status blob, kept for diagnostics.
    pub system: serde_json::Value,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: String,
}
