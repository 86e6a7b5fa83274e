//! HTTP client for a Vault-style secret store (AppRole auth, KV v2 engine).
//!
//! A short-lived client token is obtained through the role-id/secret-id
//! exchange, cached, and replaced before it enters the renewal margin.
//! Every call is retried with exponential backoff on transient failures;
//! authentication failures are returned immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::{Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretBox};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{RetryPolicy, SecretStore, SecretStoreError, SecretValue};
use crate::escrow::MasterKeySession;

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Connection settings for [`HttpSecretStore`].
#[derive(Debug)]
pub struct SecretStoreSettings {
    /// Base URL, e.g. `https://vault.internal:8200`.
    pub addr: String,
    /// KV v2 mount name.
    pub mount: String,
    pub role_id: String,
    pub secret_id: SecretBox<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Log in again once the token is this close to expiry.
    pub renew_margin: Duration,
}

struct CachedToken {
    value: SecretBox<String>,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: KvValue,
}

#[derive(Deserialize)]
struct KvValue {
    value: String,
}

#[derive(Deserialize)]
struct UnsealResponse {
    sealed: bool,
}

/// [`SecretStore`] backed by the collaborator's HTTP API.
pub struct HttpSecretStore {
    http: reqwest::Client,
    settings: SecretStoreSettings,
    token: ArcSwapOption<CachedToken>,
    login_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for HttpSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSecretStore")
            .field("addr", &self.settings.addr)
            .field("mount", &self.settings.mount)
            .finish_non_exhaustive()
    }
}

fn transport_error(err: reqwest::Error) -> SecretStoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SecretStoreError::Transient(err.to_string())
    } else {
        SecretStoreError::Protocol(err.to_string())
    }
}

/// Map statuses shared by every endpoint. Anything else is returned to the caller.
fn check_common(status: StatusCode) -> Result<(), SecretStoreError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SecretStoreError::Auth(format!("status {status}")));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(SecretStoreError::Transient(format!("status {status}")));
    }
    Ok(())
}

impl HttpSecretStore {
    /// Build the client. Does not contact the store.
    ///
    /// # Errors
    ///
    /// Returns [`SecretStoreError::Protocol`] if the HTTP client cannot be built.
    pub fn new(settings: SecretStoreSettings) -> Result<Self, SecretStoreError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .use_rustls_tls()
            .build()
            .map_err(|e| SecretStoreError::Protocol(e.to_string()))?;
        Ok(Self {
            http,
            settings,
            token: ArcSwapOption::empty(),
            login_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v1/{}", self.settings.addr.trim_end_matches('/'), suffix)
    }

    fn data_url(&self, path: &str) -> String {
        self.url(&format!("{}/data/{}", self.settings.mount, path))
    }

    fn metadata_url(&self, path: &str) -> String {
        self.url(&format!("{}/metadata/{}", self.settings.mount, path))
    }

    /// Perform the role login now. Called at startup to fail fast.
    ///
    /// # Errors
    ///
    /// [`SecretStoreError::Auth`] if the role credentials are rejected.
    pub async fn login(&self) -> Result<(), SecretStoreError> {
        self.token().await.map(|_| ())
    }

    async fn token(&self) -> Result<Arc<CachedToken>, SecretStoreError> {
        let margin = self.settings.renew_margin;
        if let Some(tok) = self.token.load_full().filter(|t| t.is_fresh(margin)) {
            return Ok(tok);
        }
        let _guard = self.login_lock.lock().await;
        // Another task may have logged in while we waited.
        if let Some(tok) = self.token.load_full().filter(|t| t.is_fresh(margin)) {
            return Ok(tok);
        }
        let tok = Arc::new(
            self.settings
                .retry
                .run("auth/approle/login", || self.login_once())
                .await?,
        );
        self.token.store(Some(Arc::clone(&tok)));
        Ok(tok)
    }

    async fn login_once(&self) -> Result<CachedToken, SecretStoreError> {
        let resp = self
            .http
            .post(self.url("auth/approle/login"))
            .json(&json!({
                "role_id": self.settings.role_id,
                "secret_id": self.settings.secret_id.expose_secret(),
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        check_common(status)?;
        if !status.is_success() {
            return Err(SecretStoreError::Auth(format!("login returned status {status}")));
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| SecretStoreError::Protocol(e.to_string()))?;
        info!(lease_secs = body.auth.lease_duration, "secret store login succeeded");
        Ok(CachedToken {
            value: SecretBox::new(Box::new(body.auth.client_token)),
            expires_at: Instant::now() + Duration::from_secs(body.auth.lease_duration),
        })
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, SecretStoreError> {
        let token = self.token().await?;
        let mut req = self
            .http
            .request(method, url)
            .header(TOKEN_HEADER, token.value.expose_secret().as_str());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(transport_error)?;
        if let Err(err) = check_common(resp.status()) {
            if matches!(err, SecretStoreError::Auth(_)) {
                // Force a fresh login for whoever calls next.
                self.token.store(None);
            }
            return Err(err);
        }
        Ok(resp)
    }

    async fn send(
        &self,
        path: &str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, SecretStoreError> {
        let result = self
            .settings
            .retry
            .run(path, || self.send_once(method.clone(), url, body))
            .await;
        let outcome = match &result {
            Ok(resp) => resp.status().as_str().to_owned(),
            Err(err) => err.to_string(),
        };
        debug!(path, %method, outcome = %outcome, "secret store call");
        result
    }

    async fn write(&self, path: &str, value: &[u8], create_only: bool) -> Result<(), SecretStoreError> {
        let mut body = json!({ "data": { "value": STANDARD.encode(value) } });
        if create_only {
            body["options"] = json!({ "cas": 0 });
        }
        let resp = self
            .send(path, Method::POST, &self.data_url(path), Some(&body))
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        // KV v2 reports a failed check-and-set as 400.
        if create_only && status == StatusCode::BAD_REQUEST {
            return Err(SecretStoreError::Conflict {
                path: path.to_owned(),
            });
        }
        Err(SecretStoreError::Protocol(format!("write returned status {status}")))
    }
}

impl SecretStore for HttpSecretStore {
    async fn put_secret(&self, path: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        self.write(path, value, false).await
    }

    async fn create_secret(&self, path: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        self.write(path, value, true).await
    }

    async fn get_secret(&self, path: &str) -> Result<SecretValue, SecretStoreError> {
        let resp = self
            .send(path, Method::GET, &self.data_url(path), None)
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SecretStoreError::NotFound {
                path: path.to_owned(),
            });
        }
        if !status.is_success() {
            return Err(SecretStoreError::Protocol(format!("read returned status {status}")));
        }
        let body: KvReadResponse = resp
            .json()
            .await
            .map_err(|e| SecretStoreError::Protocol(e.to_string()))?;
        let bytes = STANDARD
            .decode(body.data.data.value.as_bytes())
            .map_err(|_| SecretStoreError::Protocol(format!("value at {path} is not base64")))?;
        Ok(SecretBox::new(Box::new(bytes)))
    }

    async fn delete_secret(&self, path: &str) -> Result<(), SecretStoreError> {
        let resp = self
            .send(path, Method::DELETE, &self.metadata_url(path), None)
            .await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SecretStoreError::Protocol(format!("delete returned status {status}")))
        }
    }

    async fn unseal(&self, session: &MasterKeySession) -> Result<(), SecretStoreError> {
        // A sealed store cannot issue tokens, so this call is unauthenticated.
        let body = {
            let key = session
                .key(Utc::now())
                .ok_or(SecretStoreError::SessionExpired)?;
            json!({ "key": STANDARD.encode(key.material().expose()) })
        };
        let url = self.url("sys/unseal");
        let resp = self
            .settings
            .retry
            .run("sys/unseal", || async {
                let resp = self
                    .http
                    .put(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(transport_error)?;
                check_common(resp.status())?;
                Ok(resp)
            })
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SecretStoreError::Protocol(format!("unseal returned status {status}")));
        }
        let body: UnsealResponse = resp
            .json()
            .await
            .map_err(|e| SecretStoreError::Protocol(e.to_string()))?;
        info!(sealed = body.sealed, "secret store unseal submitted");
        if body.sealed {
            return Err(SecretStoreError::Protocol("store remained sealed".into()));
        }
        Ok(())
    }
}
