use std::time::Duration;

use rand::Rng;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::models::panel::Panel;
use super::error::PanelError;
use super::session::SessionCache;
use super::types::{ClientSpec, ClientTraffic, Envelope, RemoteInbound, ServerStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 500;

/// HTTP client for 3x-UI panels. One instance serves every configured
/// panel; sessions are cached per panel id in `SessionCache`.
pub struct XuiClient {
    http: reqwest::Client,
    sessions: SessionCache,
}

impl XuiClient {
    pub fn new() -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { http, sessions: SessionCache::default() })
    }

    // ── Operations ───────────────────────────────────────────────

    pub async fn get_server_status(&self, panel: &Panel) -> Result<ServerStatus, PanelError> {
        self.call_with_retry(panel, Method::GET, "/panel/api/server/status", None)
            .await
    }

    /// All inbound listeners plus their per-client traffic counters.
    pub async fn list_inbounds(&self, panel: &Panel) -> Result<Vec<RemoteInbound>, PanelError> {
        self.call_with_retry(panel, Method::GET, "/panel/api/inbounds", None)
            .await
    }

    /// Create a client on an inbound. Never retried: a lost response
    /// may still have created the client remotely, and duplicate-safety
    /// belongs to the intent log, not to blind resends.
    pub async fn add_client(
        &self,
        panel: &Panel,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<(), PanelError> {
        let body = client_body(inbound_id, spec)?;
        self.call_unit(panel, Method::POST, "/panel/api/inbounds/addClient", Some(&body))
            .await
    }

    /// Overwrite a client's traffic/expiry/enable fields. Keyed by the
    /// client UUID, so resends are idempotent.
    pub async fn update_client(
        &self,
        panel: &Panel,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<(), PanelError> {
        let path = format!("/panel/api/inbounds/updateClient/{}", spec.id);
        let body = client_body(inbound_id, spec)?;
        self.call_unit_with_retry(panel, Method::POST, &path, Some(&body))
            .await
    }

    pub async fn delete_client(
        &self,
        panel: &Panel,
        inbound_id: i64,
        client_uuid: &str,
    ) -> Result<(), PanelError> {
        let path = format!("/panel/api/inbounds/delClient/{}/{}", inbound_id, client_uuid);
        self.call_unit_with_retry(panel, Method::POST, &path, None).await
    }

    /// Traffic counters for one client, `None` if the panel does not
    /// know the identifier.
    pub async fn get_client_traffic(
        &self,
        panel: &Panel,
        email: &str,
    ) -> Result<Option<ClientTraffic>, PanelError> {
        let path = format!("/panel/api/inbounds/getClientTraffics/{}", email);
        let mut attempt = 0;
        loop {
            match self.call_opt(panel, Method::GET, &path, None).await {
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    self.backoff(&e, attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn reset_client_traffic(
        &self,
        panel: &Panel,
        inbound_id: i64,
        email: &str,
    ) -> Result<(), PanelError> {
        let path = format!("/panel/api/inbounds/{}/resetClientTraffic/{}", inbound_id, email);
        self.call_unit_with_retry(panel, Method::POST, &path, None).await
    }

    // ── Session handling ─────────────────────────────────────────

    /// Cookie for the panel, logging in if the cached session is absent
    /// or expired. The slot lock is held across check-login-store, so
    /// renewal is single-flight per panel.
    async fn session_cookie(&self, panel: &Panel) -> Result<String, PanelError> {
        let slot = self.sessions.slot(panel.id).await;
        let mut session = slot.lock().await;
        if let Some(cookie) = session.valid_cookie() {
            return Ok(cookie);
        }
        let cookie = self.login(panel).await?;
        session.store(cookie.clone());
        Ok(cookie)
    }

    async fn login(&self, panel: &Panel) -> Result<String, PanelError> {
        let url = panel_url(panel, "/login")?;
        debug!("logging in to panel {} at {}", panel.name, url);

        let resp = self
            .http
            .post(url)
            .form(&[("username", panel.username.as_str()), ("password", panel.password.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PanelError::Auth {
                message: format!("login failed (HTTP {status}): {body}"),
            });
        }

        // The session cookie arrives via Set-Cookie; keep only the
        // name=value pairs.
        let cookie = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let envelope: Envelope<serde_json::Value> =
            resp.json().await.map_err(|e| PanelError::Decode {
                message: format!("login response: {e}"),
            })?;
        if !envelope.success {
            return Err(PanelError::Auth { message: envelope.msg });
        }
        if cookie.is_empty() {
            return Err(PanelError::Auth {
                message: "login succeeded but no session cookie was set".into(),
            });
        }

        debug!("panel {} session established", panel.name);
        Ok(cookie)
    }

    // ── Request plumbing ─────────────────────────────────────────

    /// One envelope call with a single re-authentication retry on 401.
    async fn call_raw<T: DeserializeOwned>(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Envelope<T>, PanelError> {
        let cookie = self.session_cookie(panel).await?;
        match self.send(panel, method.clone(), path, body, &cookie).await {
            Err(PanelError::Http { status: 401, .. }) => {
                debug!("panel {} session rejected, re-authenticating", panel.name);
                self.sessions.invalidate(panel.id, &cookie).await;
                let cookie = self.session_cookie(panel).await?;
                self.send(panel, method, path, body, &cookie).await
            }
            other => other,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        cookie: &str,
    ) -> Result<Envelope<T>, PanelError> {
        let url = panel_url(panel, path)?;
        let mut req = self.http.request(method, url).header(COOKIE, cookie);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PanelError::Http { status: 401, message: "session expired".into() });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PanelError::Http { status: status.as_u16(), message });
        }

        resp.json().await.map_err(|e| PanelError::Decode {
            message: format!("{path}: {e}"),
        })
    }

    /// Envelope call that must carry an `obj` payload.
    async fn call<T: DeserializeOwned>(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, PanelError> {
        let envelope: Envelope<T> = self.call_raw(panel, method, path, body).await?;
        if !envelope.success {
            return Err(PanelError::Api { message: envelope.msg });
        }
        envelope.obj.ok_or_else(|| PanelError::Decode {
            message: format!("{path}: envelope missing obj"),
        })
    }

    /// Envelope call where a missing `obj` means "not found".
    async fn call_opt<T: DeserializeOwned>(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>, PanelError> {
        let envelope: Envelope<T> = self.call_raw(panel, method, path, body).await?;
        if !envelope.success {
            return Err(PanelError::Api { message: envelope.msg });
        }
        Ok(envelope.obj)
    }

    /// Envelope call for action endpoints that return `obj: null`.
    async fn call_unit(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), PanelError> {
        let envelope: Envelope<serde_json::Value> =
            self.call_raw(panel, method, path, body).await?;
        if !envelope.success {
            return Err(PanelError::Api { message: envelope.msg });
        }
        Ok(())
    }

    async fn call_with_retry<T: DeserializeOwned>(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, PanelError> {
        let mut attempt = 0;
        loop {
            match self.call(panel, method.clone(), path, body).await {
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    self.backoff(&e, attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn call_unit_with_retry(
        &self,
        panel: &Panel,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), PanelError> {
        let mut attempt = 0;
        loop {
            match self.call_unit(panel, method.clone(), path, body).await {
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    self.backoff(&e, attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn backoff(&self, err: &PanelError, attempt: u32) {
        let base = RETRY_BASE_MS << attempt;
        let jitter = rand::rng().random_range(0..100);
        let delay = Duration::from_millis(base + jitter);
        warn!("panel call failed ({err}), retrying in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

fn panel_url(panel: &Panel, path: &str) -> Result<Url, PanelError> {
    // Concatenate instead of Url::join so a web base path on the panel
    // URL (a common 3x-UI setup) survives.
    let raw = format!("{}{}", panel.base_url.trim_end_matches('/'), path);
    Ok(Url::parse(&raw)?)
}

fn client_body(inbound_id: i64, spec: &ClientSpec) -> Result<serde_json::Value, PanelError> {
    // 3x-UI expects the client list as a JSON-encoded string field.
    let settings = serde_json::to_string(&json!({ "clients": [spec] }))
        .map_err(|e| PanelError::Decode { message: format!("client spec: {e}") })?;
    Ok(json!({ "id": inbound_id, "settings": settings }))
}
