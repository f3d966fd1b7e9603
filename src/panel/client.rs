//! HTTP client for the Marzban panel API.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::TokenResponse;
use super::{AdminPatch, AdminSpec, PanelAdmin, PanelError, PanelExport, PanelResult};
use crate::config::{PanelConfig, RetryPolicy};

/// Refresh this long before the assumed token expiry.
const TOKEN_LEEWAY: Duration = Duration::from_secs(30);

/// Operations the rest of the system needs from the panel.
///
/// The seam exists so the synchronizer and restore executor can be exercised
/// against an in-memory panel in tests.
#[allow(async_fn_in_trait)]
pub trait PanelApi {
    /// Lists all admin accounts.
    async fn list_admins(&self) -> PanelResult<Vec<PanelAdmin>>;

    /// Creates an admin account.
    async fn create_admin(&self, spec: &AdminSpec) -> PanelResult<PanelAdmin>;

    /// Deletes an admin account. Deleting an absent account succeeds.
    async fn delete_admin(&self, username: &str) -> PanelResult<()>;

    /// Applies a partial update to an admin account.
    async fn edit_admin(&self, username: &str, patch: &AdminPatch) -> PanelResult<PanelAdmin>;

    /// Takes a point-in-time export of panel state.
    async fn export_state(&self) -> PanelResult<PanelExport>;
}

/// In-memory bearer session. Never persisted.
struct Session {
    token: String,
    expires_at: Instant,
}

impl Session {
    fn is_valid(&self) -> bool {
        Instant::now() + TOKEN_LEEWAY < self.expires_at
    }
}

/// Authenticated client for the panel API.
///
/// Owns the token lifecycle and the retry policy. Updates no local state;
/// callers propagate results into the local store themselves.
pub struct PanelClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token_ttl: Duration,
    retry: RetryPolicy,

    /// Single-flight refresh guard: holders of the lock either observe a
    /// valid session or perform the one in-flight refresh everyone else
    /// awaits.
    session: Mutex<Option<Session>>,
}

impl PanelClient {
    /// Creates a client from panel settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &PanelConfig, retry: RetryPolicy) -> PanelResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PanelError::Permanent {
                status: 0,
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
            retry,
            session: Mutex::new(None),
        })
    }

    /// Forces a fresh authentication, replacing any cached session.
    ///
    /// # Errors
    ///
    /// Returns `PanelError::Auth` on rejected credentials.
    pub async fn authenticate(&self) -> PanelResult<()> {
        let mut guard = self.session.lock().await;
        *guard = Some(self.login().await?);
        info!("Authenticated with panel at {}", self.base_url);
        Ok(())
    }

    /// Exchanges credentials for a bearer token.
    async fn login(&self) -> PanelResult<Session> {
        let url = format!("{}/api/admin/token", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("grant_type", "password"),
        ];

        let response = self.http.post(&url).form(&form).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PanelError::Auth(format!(
                "panel rejected credentials (HTTP {status})"
            )));
        }
        if status.is_server_error() {
            return Err(PanelError::Transient(format!(
                "token endpoint unavailable (HTTP {status})"
            )));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PanelError::Permanent {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PanelError::Malformed(format!("token response: {e}")))?;

        if token.access_token.is_empty() {
            return Err(PanelError::Malformed("empty access token".to_owned()));
        }

        Ok(Session {
            token: token.access_token,
            expires_at: Instant::now() + self.token_ttl,
        })
    }

    /// Returns a valid bearer token, refreshing single-flight if needed.
    async fn bearer(&self) -> PanelResult<String> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.is_valid()
        {
            return Ok(session.token.clone());
        }

        debug!("Refreshing panel session token");
        let session = self.login().await?;
        let token = session.token.clone();
        *guard = Some(session);
        Ok(token)
    }

    /// Drops the cached session so the next call re-authenticates.
    async fn invalidate(&self) {
        let mut guard = self.session.lock().await;
        *guard = None;
    }

    /// Sends a request with retry, backoff and one re-authentication.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> PanelResult<reqwest::Response> {
        let url = format!("{}/api/{}", self.base_url, path.trim_start_matches('/'));
        let mut reauthenticated = false;
        let mut attempt: u32 = 1;

        loop {
            // A transient token refresh failure goes through the same
            // backoff as a transient request failure.
            let outcome = match self.bearer().await {
                Ok(token) => {
                    let mut request =
                        self.http.request(method.clone(), &url).bearer_auth(token);
                    if let Some(json) = body {
                        request = request.json(json);
                    }

                    match request.send().await {
                        Ok(response) => {
                            let status = response.status();
                            if status.is_success() {
                                return Ok(response);
                            }
                            if status == StatusCode::UNAUTHORIZED {
                                self.invalidate().await;
                                if reauthenticated {
                                    return Err(PanelError::Auth(
                                        "still unauthorized after re-authentication".to_owned(),
                                    ));
                                }
                                warn!("Panel token rejected, re-authenticating once");
                                reauthenticated = true;
                                continue;
                            }
                            if status.is_server_error() {
                                Err(PanelError::Transient(format!(
                                    "{method} {path} failed with HTTP {status}"
                                )))
                            } else {
                                let message = response.text().await.unwrap_or_default();
                                return Err(PanelError::Permanent {
                                    status: status.as_u16(),
                                    message,
                                });
                            }
                        }
                        Err(e) => Err(PanelError::from(e)),
                    }
                }
                Err(err) => Err(err),
            };

            match outcome {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Transient panel failure on {} {} (attempt {}/{}), retrying in {:?}: {}",
                        method, path, attempt, self.retry.max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
                Ok(()) => unreachable!("success returns early"),
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> PanelResult<T> {
        response
            .json()
            .await
            .map_err(|e| PanelError::Malformed(format!("{what}: {e}")))
    }

    /// Fetches the panel's system status blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not JSON.
    pub async fn system_status(&self) -> PanelResult<serde_json::Value> {
        let response = self.request(Method::GET, "system", None).await?;
        Self::decode(response, "system status").await
    }
}

impl PanelApi for PanelClient {
    async fn list_admins(&self) -> PanelResult<Vec<PanelAdmin>> {
        let response = self.request(Method::GET, "admins", None).await?;
        Self::decode(response, "admin list").await
    }

    async fn create_admin(&self, spec: &AdminSpec) -> PanelResult<PanelAdmin> {
        let body = serde_json::to_value(spec)
            .map_err(|e| PanelError::Malformed(format!("admin spec: {e}")))?;
        let response = self.request(Method::POST, "admin", Some(&body)).await?;
        Self::decode(response, "created admin").await
    }

    async fn delete_admin(&self, username: &str) -> PanelResult<()> {
        let path = format!("admin/{username}");
        match self.request(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            // Deleting an already-absent admin is a success for callers.
            Err(err) if err.is_not_found() => {
                debug!("Admin '{}' already absent on panel", username);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn edit_admin(&self, username: &str, patch: &AdminPatch) -> PanelResult<PanelAdmin> {
        let body = serde_json::to_value(patch)
            .map_err(|e| PanelError::Malformed(format!("admin patch: {e}")))?;
        let path = format!("admin/{username}");
        let response = self.request(Method::PUT, &path, Some(&body)).await?;
        Self::decode(response, "edited admin").await
    }

    async fn export_state(&self) -> PanelResult<PanelExport> {
        let admins = self.list_admins().await?;
        let system = self.system_status().await?;
        Ok(PanelExport {
            fetched_at: Utc::now(),
            admins,
            system,
        })
    }
}

impl std::fmt::Debug for PanelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
