//! Shared test doubles.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};

use crate::panel::{
    AdminPatch, AdminSpec, PanelAdmin, PanelApi, PanelError, PanelExport, PanelResult,
};
use crate::store::AdminStatus;

/// In-memory panel double used across the crate's tests.
#[derive(Default)]
pub struct MockPanel {
    pub admins: Mutex<HashMap<String, PanelAdmin>>,
    /// Error returned by the next call, then cleared.
    pub fail_next: Mutex<Option<PanelError>>,
    /// Error returned by every `edit_admin` call while set.
    pub fail_edits: Mutex<Option<PanelError>>,
    pub disable_calls: Mutex<Vec<String>>,
}

impl MockPanel {
    pub fn with_admins(admins: Vec<PanelAdmin>) -> Self {
        let map = admins.into_iter().map(|a| (a.username.clone(), a)).collect();
        Self {
            admins: Mutex::new(map),
            ..Self::default()
        }
    }

    fn take_failure(&self) -> Option<PanelError> {
        self.fail_next.lock().unwrap().take()
    }
}

impl PanelApi for MockPanel {
    async fn list_admins(&self) -> PanelResult<Vec<PanelAdmin>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut admins: Vec<_> = self.admins.lock().unwrap().values().cloned().collect();
        admins.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(admins)
    }

    async fn create_admin(&self, spec: &AdminSpec) -> PanelResult<PanelAdmin> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let admin = PanelAdmin {
            username: spec.username.clone(),
            is_sudo: spec.is_sudo,
            data_limit: spec.data_limit,
            used_traffic: 0,
            expire_at: spec.expire_at,
            status: AdminStatus::Active,
        };
        self.admins
            .lock()
            .unwrap()
            .insert(admin.username.clone(), admin.clone());
        Ok(admin)
    }

    async fn delete_admin(&self, username: &str) -> PanelResult<()> {
        if let Some(err) = self.take_failure() {
            if err.is_not_found() {
                // Mirrors the real client: absent on delete is success.
                return Ok(());
            }
            return Err(err);
        }
        self.admins.lock().unwrap().remove(username);
        Ok(())
    }

    async fn edit_admin(&self, username: &str, patch: &AdminPatch) -> PanelResult<PanelAdmin> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if let Some(err) = self.fail_edits.lock().unwrap().clone() {
            return Err(err);
        }
        let mut admins = self.admins.lock().unwrap();
        let admin = admins.get_mut(username).ok_or(PanelError::Permanent {
            status: 404,
            message: "Admin not found".to_owned(),
        })?;
        if let Some(is_sudo) = patch.is_sudo {
            admin.is_sudo = is_sudo;
        }
        if let Some(limit) = patch.data_limit {
            admin.data_limit = limit;
        }
        if let Some(used) = patch.used_traffic {
            admin.used_traffic = used;
        }
        if let Some(expiry) = patch.expire_at {
            admin.expire_at = expiry;
        }
        if let Some(status) = patch.status {
            if status == AdminStatus::Disabled {
                self.disable_calls.lock().unwrap().push(username.to_owned());
            }
            admin.status = status;
        }
        Ok(admin.clone())
    }

    async fn export_state(&self) -> PanelResult<PanelExport> {
        Ok(PanelExport {
            fetched_at: Utc::now(),
            admins: self.list_admins().await?,
            system: serde_json::json!({"version": "mock"}),
        })
    }
}

/// An active admin with a 10 GiB quota expiring in 30 days.
pub fn panel_admin(username: &str) -> PanelAdmin {
    PanelAdmin {
        username: username.to_owned(),
        is_sudo: false,
        data_limit: Some(10 * 1024 * 1024 * 1024),
        used_traffic: 0,
        expire_at: Some(Utc::now() + Duration::days(30)),
        status: AdminStatus::Active,
    }
}
