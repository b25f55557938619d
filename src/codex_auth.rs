use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const TOKEN_REFRESH_URL: &str = "https://auth.openai.com/oauth/token";
pub const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
/// Tokens with less than this many seconds left are refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub account_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read auth file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write auth file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid auth file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid access token: {0}")]
    InvalidToken(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Source of the bearer token and account id sent to the codex backend.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken, AuthError>;
}

/// A fixed token, for deployments that manage credentials elsewhere.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub AccessToken);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self) -> Result<AccessToken, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_mode: Option<String>,
    tokens: AuthTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refresh: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthTokens {
    #[serde(default)]
    id_token: String,
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    account_id: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl AuthFile {
    fn token(&self) -> AccessToken {
        AccessToken {
            access_token: self.tokens.access_token.clone(),
            account_id: self.tokens.account_id.clone(),
        }
    }
}

/// Reads the codex CLI's `auth.json` and refreshes its OAuth tokens when they
/// are about to expire, writing the new tokens back to the same file.
pub struct CodexAuth {
    path: PathBuf,
    http: reqwest::Client,
    refresh_url: String,
    refresh_lock: Mutex<()>,
}

impl CodexAuth {
    pub fn new(path: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            path: path.into(),
            http,
            refresh_url: TOKEN_REFRESH_URL.to_string(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = url.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn refresh(&self, mut auth: AuthFile) -> Result<AuthFile, AuthError> {
        tracing::info!(path = %self.path.display(), "refreshing codex access token");
        let resp = self
            .http
            .post(&self.refresh_url)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": auth.tokens.refresh_token,
                "client_id": OAUTH_CLIENT_ID,
            }))
            .send()
            .await
            .map_err(|err| AuthError::Refresh(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AuthError::Refresh(format!("status {}: {}", status, text)));
        }
        let data: RefreshResponse = resp
            .json()
            .await
            .map_err(|err| AuthError::Refresh(err.to_string()))?;

        auth.tokens.access_token = data.access_token;
        if let Some(refresh_token) = data.refresh_token {
            auth.tokens.refresh_token = refresh_token;
        }
        if let Some(id_token) = data.id_token {
            auth.tokens.id_token = id_token;
        }
        auth.last_refresh = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        write_auth_file(&self.path, &auth).await?;
        Ok(auth)
    }
}

#[async_trait]
impl CredentialProvider for CodexAuth {
    async fn get_token(&self) -> Result<AccessToken, AuthError> {
        let auth = read_auth_file(&self.path).await?;
        let now = Utc::now().timestamp();
        if !expiring_soon(&auth.tokens.access_token, now)? {
            return Ok(auth.token());
        }

        let _guard = self.refresh_lock.lock().await;
        // Another request may have refreshed while this one waited.
        let auth = read_auth_file(&self.path).await?;
        if !expiring_soon(&auth.tokens.access_token, now)? {
            return Ok(auth.token());
        }
        Ok(self.refresh(auth).await?.token())
    }
}

async fn read_auth_file(path: &Path) -> Result<AuthFile, AuthError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AuthError::Read {
            path: path.display().to_string(),
            source,
        })?;
    Ok(serde_json::from_str(&raw)?)
}

async fn write_auth_file(path: &Path, auth: &AuthFile) -> Result<(), AuthError> {
    let raw = serde_json::to_string_pretty(auth)?;
    tokio::fs::write(path, raw)
        .await
        .map_err(|source| AuthError::Write {
            path: path.display().to_string(),
            source,
        })
}

/// Reads `exp` from a JWT payload without verifying the signature.
pub fn jwt_expiry(token: &str) -> Result<Option<i64>, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidToken("expected three JWT segments".to_string()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
    Ok(payload
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))))
}

// A token without `exp` is used as-is.
fn expiring_soon(token: &str, now: i64) -> Result<bool, AuthError> {
    Ok(jwt_expiry(token)?.is_some_and(|exp| exp - now < REFRESH_MARGIN_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn make_jwt(payload: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.sig")
    }

    fn write_auth(dir: &TempDir, access_token: &str) -> PathBuf {
        let path = dir.path().join("auth.json");
        let raw = json!({
            "auth_mode": "chatgpt",
            "OPENAI_API_KEY": null,
            "tokens": {
                "id_token": "id-old",
                "access_token": access_token,
                "refresh_token": "refresh-old",
                "account_id": "acct_123"
            },
            "last_refresh": "2025-01-01T00:00:00.000Z"
        });
        std::fs::write(&path, raw.to_string()).unwrap();
        path
    }

    #[test]
    fn expiry_is_read_from_payload() {
        let token = make_jwt(json!({ "exp": 1_900_000_000, "sub": "user" }));
        assert_eq!(jwt_expiry(&token).unwrap(), Some(1_900_000_000));
        assert_eq!(jwt_expiry(&make_jwt(json!({}))).unwrap(), None);
        assert!(matches!(jwt_expiry("not-a-jwt"), Err(AuthError::InvalidToken(_))));
        assert!(matches!(jwt_expiry("a.!!!.c"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn refresh_margin_is_five_minutes() {
        let now = 1_000_000;
        let soon = make_jwt(json!({ "exp": now + 299 }));
        let later = make_jwt(json!({ "exp": now + 301 }));
        assert!(expiring_soon(&soon, now).unwrap());
        assert!(!expiring_soon(&later, now).unwrap());
        assert!(!expiring_soon(&make_jwt(json!({ "sub": "x" })), now).unwrap());
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let dir = TempDir::new().unwrap();
        let token = make_jwt(json!({ "exp": Utc::now().timestamp() + 3600 }));
        let path = write_auth(&dir, &token);
        let auth = CodexAuth::new(&path, reqwest::Client::new())
            .with_refresh_url("http://127.0.0.1:9/unreachable");
        let got = auth.get_token().await.unwrap();
        assert_eq!(got.access_token, token);
        assert_eq!(got.account_id, "acct_123");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let auth = CodexAuth::new(dir.path().join("nope.json"), reqwest::Client::new());
        assert!(matches!(auth.get_token().await, Err(AuthError::Read { .. })));
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_persisted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let new_token = make_jwt(json!({ "exp": Utc::now().timestamp() + 7200 }));
        let app = {
            let calls = calls.clone();
            let new_token = new_token.clone();
            axum::Router::new().route(
                "/oauth/token",
                post(move |Json(body): Json<Value>| {
                    let calls = calls.clone();
                    let new_token = new_token.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(body["grant_type"], json!("refresh_token"));
                        assert_eq!(body["refresh_token"], json!("refresh-old"));
                        assert_eq!(body["client_id"], json!(OAUTH_CLIENT_ID));
                        Json(json!({
                            "access_token": new_token,
                            "refresh_token": "refresh-new",
                            "id_token": "id-new"
                        }))
                    }
                }),
            )
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let dir = TempDir::new().unwrap();
        let old = make_jwt(json!({ "exp": Utc::now().timestamp() + 10 }));
        let path = write_auth(&dir, &old);
        let auth = CodexAuth::new(&path, reqwest::Client::new())
            .with_refresh_url(format!("http://{addr}/oauth/token"));

        let got = auth.get_token().await.unwrap();
        assert_eq!(got.access_token, new_token);
        assert_eq!(got.account_id, "acct_123");

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["tokens"]["access_token"], json!(new_token));
        assert_eq!(saved["tokens"]["refresh_token"], json!("refresh-new"));
        assert_eq!(saved["tokens"]["id_token"], json!("id-new"));
        assert_eq!(saved["auth_mode"], json!("chatgpt"));
        assert!(saved.get("OPENAI_API_KEY").is_some());
        assert_ne!(saved["last_refresh"], json!("2025-01-01T00:00:00.000Z"));

        // The persisted token is fresh now, so no second refresh happens.
        auth.get_token().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_rejection_is_reported() {
        let app = axum::Router::new().route(
            "/oauth/token",
            post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "revoked") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let dir = TempDir::new().unwrap();
        let path = write_auth(&dir, &make_jwt(json!({ "exp": 0 })));
        let auth = CodexAuth::new(&path, reqwest::Client::new())
            .with_refresh_url(format!("http://{addr}/oauth/token"));
        match auth.get_token().await {
            Err(AuthError::Refresh(msg)) => assert!(msg.contains("401")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
