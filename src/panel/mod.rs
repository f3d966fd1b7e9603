//! Panel API client: the authenticated remote-access boundary.
//!
//! Everything here is a pure wrapper around the panel's HTTPS API. No local
//! state is updated on success; callers propagate results themselves.

mod client;
mod types;

pub use client::{PanelApi, PanelClient};
pub use types::{AdminPatch, AdminSpec, PanelAdmin, PanelExport};

/// Errors surfaced by panel operations.
///
/// The variants drive the caller-side policy: `Transient` is retried with
/// backoff, `Auth` gets exactly one re-authenticate-and-retry, `Permanent`
/// and `Malformed` are surfaced immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PanelError {
    #[error("Panel authentication failed: {0}")]
    Auth(String),

    #[error("Transient panel failure: {0}")]
    Transient(String),

    #[error("Panel rejected the request (HTTP {status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Panel returned malformed data: {0}")]
    Malformed(String),
}

impl PanelError {
    /// True for failures that the retry policy may attempt again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True when the failure was an HTTP 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Permanent { status: 404, .. })
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            // Connect failures, timeouts and mid-body aborts are all
            // worth a retry.
            Self::Transient(err.to_string())
        }
    }
}

pub type PanelResult<T> = Result<T, PanelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = PanelError::Permanent {
            status: 404,
            message: "Admin not found".to_owned(),
        };
        assert!(err.is_not_found());

        let err = PanelError::Permanent {
            status: 409,
            message: "Admin already exists".to_owned(),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_transient_detection() {
        assert!(PanelError::Transient("timeout".to_owned()).is_transient());
        assert!(!PanelError::Auth("bad token".to_owned()).is_transient());
    }
}
