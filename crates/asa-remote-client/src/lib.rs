// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::io::Write;
use std::time::Duration;

use asa_retry::{retry, RetryPolicy};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("activity-sync-agent/", env!("CARGO_PKG_VERSION"));

/// Errors from the remote sync service, classified for retry control
/// flow: only [`RemoteError::Transient`] is retried by this crate.
#[derive(Debug, Error, Clone)]
pub enum RemoteError {
    /// A retryable failure: network error, request timeout, or 5xx.
    #[error("transient remote error: {0}")]
    Transient(String),
    /// Credentials were rejected (401) or forbidden (403).
    #[error("remote authentication required")]
    Auth,
    /// A non-retryable client error (4xx other than 401/403).
    #[error("remote rejected request ({status}): {message}")]
    Permanent {
        /// HTTP status code.
        status: u16,
        /// Remote-provided error message, if any.
        message: String,
    },
}

impl RemoteError {
    fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        let message = extract_error_message(body).unwrap_or_else(|| body.chars().take(200).collect());
        if status.as_u16() == 401 || status.as_u16() == 403 {
            RemoteError::Auth
        } else if status.is_server_error() {
            RemoteError::Transient(format!("{status}: {message}"))
        } else {
            RemoteError::Permanent {
                status: status.as_u16(),
                message,
            }
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Unwraps the remote service's `{success, data, meta}` response envelope
/// to its `data` field, per spec.md §4.2/§6.1. Responses that don't look
/// like the envelope (no top-level `data` key, or `data` missing while
/// `success` is absent) are passed through unchanged so endpoints that
/// return a bare JSON body still deserialize.
fn unwrap_envelope(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Object(ref map) if map.contains_key("success") && map.contains_key("data") => {
            map.get("data").cloned().unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Device identity sent with the auth exchange and included in the
/// `User-Agent` header.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    /// Stable per-install device id.
    pub device_id: String,
    /// Machine hostname.
    pub hostname: String,
    /// Operating system name, e.g. `"macos"`, `"linux"`, `"windows"`.
    pub os_name: String,
    /// Operating system version string.
    pub os_version: String,
    /// This agent's own version.
    pub agent_version: String,
}

impl DeviceInfo {
    /// Collect device info from the running environment.
    pub fn collect(device_id: String) -> Self {
        Self {
            device_id,
            hostname: hostname_best_effort(),
            os_name: std::env::consts::OS.to_string(),
            os_version: "unknown".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Result of a successful device code exchange.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthResult {
    /// Bearer token for subsequent requests.
    pub access_token: String,
    /// The authenticated user's profile.
    pub user: AuthUser,
}

/// User profile returned alongside a fresh access token.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthUser {
    /// Account email.
    pub email: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Normalized result of a batch event upload, regardless of whether the
/// server used the current or legacy response shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    /// Events the server accepted.
    pub processed: u32,
    /// Events the server rejected or deferred.
    pub failed: u32,
}

impl<'de> Deserialize<'de> for BatchResult {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            processed: Option<u32>,
            #[serde(default)]
            failed: Option<u32>,
            #[serde(default)]
            synced: Option<u32>,
            #[serde(default)]
            queued: Option<u32>,
        }
        let raw = Raw::deserialize(deserializer)?;
        match (raw.processed, raw.failed) {
            (Some(processed), Some(failed)) => Ok(BatchResult { processed, failed }),
            _ => Ok(BatchResult {
                processed: raw.synced.unwrap_or(0),
                failed: raw.queued.unwrap_or(0),
            }),
        }
    }
}

/// Client for the remote activity sync API.
pub struct RemoteClient {
    http: reqwest::Client,
    api_url: String,
    token: RwLock<Option<String>>,
    device_id: String,
    compress: bool,
    retry_policy: RetryPolicy,
}

impl RemoteClient {
    /// Build a client for `api_url` with the given device id.
    pub fn new(api_url: impl Into<String>, device_id: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a plain timeout");
        Self {
            http,
            api_url: api_url.into(),
            token: RwLock::new(None),
            device_id: device_id.into(),
            compress: true,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Toggle gzip compression of request bodies.
    pub fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    /// Install the bearer token used for authenticated requests.
    pub async fn set_credentials(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    /// Clear stored credentials (e.g. after an [`RemoteError::Auth`]).
    pub async fn clear_credentials(&self) {
        *self.token.write().await = None;
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), endpoint.trim_start_matches('/'))
    }

    async fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, "application/json".parse().unwrap());
        headers.insert(reqwest::header::USER_AGENT, USER_AGENT.parse().unwrap());
        headers.insert("X-Device-ID", self.device_id.parse().unwrap());
        if let Some(token) = self.token.read().await.as_ref() {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {token}").parse().unwrap(),
            );
        }
        headers
    }

    async fn send_once<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
        compress: bool,
    ) -> Result<T, RemoteError> {
        let url = self.url(endpoint);
        let mut req = self.http.request(method, &url).headers(self.headers().await);

        if let Some(body) = body {
            let json = serde_json::to_vec(body).expect("serde_json::Value always serializes");
            if compress && !json.is_empty() {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&json).map_err(|e| RemoteError::Transient(e.to_string()))?;
                let gz = encoder.finish().map_err(|e| RemoteError::Transient(e.to_string()))?;
                req = req
                    .header(reqwest::header::CONTENT_ENCODING, "gzip")
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(gz);
            } else {
                req = req.json(body);
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_response(status, &text));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| RemoteError::Transient(e.to_string()));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("decode failed: {e}")))?;
        let unwrapped = unwrap_envelope(body);
        serde_json::from_value(unwrapped).map_err(|e| RemoteError::Transient(format!("decode failed: {e}")))
    }

    async fn retried<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, RemoteError> {
        let outcome = retry(
            &self.retry_policy,
            || self.send_once::<T>(method.clone(), endpoint, body, self.compress),
            RemoteError::is_retryable,
        )
        .await;

        match outcome {
            Ok(o) => Ok(o.value),
            Err(asa_retry::RetryError::RetriesExhausted { last_error, .. }) => Err(last_error),
            Err(asa_retry::RetryError::OverallTimeoutExceeded { last_error, .. }) => {
                warn!(target: "asa.remote", %last_error, "retry budget exceeded");
                Err(RemoteError::Transient(last_error))
            }
        }
    }

    /// Exchange a browser-issued device authorization code for a bearer
    /// token. Does not retry: auth failures should surface to the user
    /// immediately. Posts to `api/v1/sync/auth/token`, reached at the
    /// same `api_url` base as every other endpoint since the agent is
    /// configured with a single service origin.
    pub async fn exchange_code(
        &self,
        code: &str,
        device_name: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthResult, RemoteError> {
        let body = serde_json::json!({
            "code": code,
            "device_name": device_name,
            "code_verifier": code_verifier,
            "platform": std::env::consts::OS,
            "os_version": "unknown",
            "machine_id": self.device_id,
            "agent_version": env!("CARGO_PKG_VERSION"),
        });
        self.send_once(reqwest::Method::POST, "api/v1/sync/auth/token", Some(&body), false)
            .await
    }

    /// Revoke the current credentials server-side. Best-effort: failures
    /// are reported but never retried.
    pub async fn revoke(&self) -> Result<(), RemoteError> {
        let _: serde_json::Value = self
            .send_once(reqwest::Method::POST, "revoke", None, false)
            .await
            .or_else(|e| match e {
                RemoteError::Auth => Ok(serde_json::Value::Null),
                other => Err(other),
            })?;
        Ok(())
    }

    /// Single-attempt reachability probe. Any response from the server,
    /// including an error status, counts as reachable; only a
    /// connection-level failure does not.
    pub async fn is_reachable(&self) -> bool {
        match self
            .send_once::<serde_json::Value>(reqwest::Method::GET, "events/status", None, false)
            .await
        {
            Ok(_) | Err(RemoteError::Permanent { .. }) | Err(RemoteError::Auth) => true,
            Err(RemoteError::Transient(_)) => false,
        }
    }

    /// Open a sync session.
    pub async fn start_session(&self) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.retried(reqwest::Method::POST, "sessions/start", None).await?;
        Ok(())
    }

    /// Close the current sync session with a reason (e.g. `"app_quit"`,
    /// `"idle_timeout"`, `"private_time"`, `"server_pause"`, `"server_deregister"`).
    pub async fn end_session(&self, reason: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({"reason": reason});
        let _: serde_json::Value = self.retried(reqwest::Method::POST, "sessions/end", Some(&body)).await?;
        Ok(())
    }

    /// Upload a batch of already-privacy-filtered events.
    pub async fn send_events(&self, events: &[serde_json::Value]) -> Result<BatchResult, RemoteError> {
        let body = serde_json::json!({"events": events});
        debug!(count = events.len(), "sending event batch");
        self.retried(reqwest::Method::POST, "events/batch", Some(&body)).await
    }

    /// Send a liveness heartbeat carrying this agent's version and
    /// timezone. Returns the raw response body, which may carry server
    /// commands (`pause`, `deregister`), a `config_updated` flag, and a
    /// `minimum_agent_version` floor for the caller to act on.
    pub async fn heartbeat(&self) -> Result<serde_json::Value, RemoteError> {
        let timezone = chrono::Local::now().format("%:z").to_string();
        let body = serde_json::json!({
            "agent_version": env!("CARGO_PKG_VERSION"),
            "timezone": timezone,
        });
        self.retried(reqwest::Method::POST, "heartbeat", Some(&body)).await
    }

    /// Fetch the server's reported status for this device: today's
    /// summary and any currently active session.
    pub async fn get_status(&self) -> Result<serde_json::Value, RemoteError> {
        self.retried(reqwest::Method::GET, "events/status", None).await
    }

    /// Fetch server-driven config overrides.
    pub async fn get_config(&self) -> Result<serde_json::Value, RemoteError> {
        self.retried(reqwest::Method::GET, "config", None).await
    }

    /// Fetch the user's project list.
    pub async fn get_projects(&self) -> Result<serde_json::Value, RemoteError> {
        self.retried(reqwest::Method::GET, "projects", None).await
    }

    /// Fetch the server's category mapping rules.
    pub async fn get_categories(&self) -> Result<serde_json::Value, RemoteError> {
        self.retried(reqwest::Method::GET, "categories", None).await
    }

    /// Fetch aggregate trend data for the dashboard.
    pub async fn get_trends(&self) -> Result<serde_json::Value, RemoteError> {
        self.retried(reqwest::Method::GET, "trends", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_result_prefers_current_shape() {
        let v: BatchResult = serde_json::from_value(serde_json::json!({"processed": 3, "failed": 1})).unwrap();
        assert_eq!(v, BatchResult { processed: 3, failed: 1 });
    }

    #[test]
    fn batch_result_falls_back_to_legacy_alias() {
        let v: BatchResult = serde_json::from_value(serde_json::json!({"synced": 5, "queued": 2})).unwrap();
        assert_eq!(v, BatchResult { processed: 5, failed: 2 });
    }

    #[tokio::test]
    async fn send_events_classifies_401_as_auth() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events/batch"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "expired"})))
            .mount(&server)
            .await;

        let client = RemoteClient::new(server.uri(), "device-1", Duration::from_secs(2));
        let err = client.send_events(&[]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Auth));
    }

    #[tokio::test]
    async fn send_events_retries_5xx_then_succeeds() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events/batch"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/events/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"processed": 2, "failed": 0})))
            .mount(&server)
            .await;

        let mut client = RemoteClient::new(server.uri(), "device-1", Duration::from_secs(2));
        client.set_compress(false);
        let result = client.send_events(&[serde_json::json!({"id": 1})]).await.unwrap();
        assert_eq!(result, BatchResult { processed: 2, failed: 0 });
    }

    #[test]
    fn envelope_unwraps_data_field() {
        let enveloped = serde_json::json!({"success": true, "data": {"processed": 4, "failed": 1}, "meta": {}});
        assert_eq!(unwrap_envelope(enveloped), serde_json::json!({"processed": 4, "failed": 1}));
    }

    #[test]
    fn envelope_passes_through_bare_body() {
        let bare = serde_json::json!({"processed": 4, "failed": 1});
        assert_eq!(unwrap_envelope(bare.clone()), bare);
    }

    #[tokio::test]
    async fn send_events_unwraps_success_data_envelope() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": {"processed": 2, "failed": 0},
                "meta": {"request_id": "abc"},
            })))
            .mount(&server)
            .await;

        let mut client = RemoteClient::new(server.uri(), "device-1", Duration::from_secs(2));
        client.set_compress(false);
        let result = client.send_events(&[serde_json::json!({"id": 1})]).await.unwrap();
        assert_eq!(result, BatchResult { processed: 2, failed: 0 });
    }
}
