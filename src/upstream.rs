use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe the inbound connection rather than the request and are
/// never forwarded upstream.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "proxy-connection",
    "upgrade",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Shared client: connect timeout only, since streamed bodies may run for minutes.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("claude-multi-proxy/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

/// POSTs a JSON body with bearer auth and returns the response once its status
/// is known to be 2xx. The body is left unread for streaming.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: &str,
    extra_headers: &[(&str, &str)],
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client.post(url).bearer_auth(bearer).json(body);
    for (k, v) in extra_headers {
        req = req.header(*k, *v);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, truncate(&text, 300)),
        )
        .with_code(code));
    }
    Ok(resp)
}

/// Sends the inbound request to `base_url` + `path_and_query` unchanged apart
/// from connection-level headers. Any status is returned to the caller as is.
pub async fn forward_raw(
    client: &reqwest::Client,
    base_url: &str,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(base_url, path_and_query);
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if !SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    client
        .request(method, url)
        .headers(forwarded)
        .body(body)
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))
}

/// Response headers worth relaying back to the client.
pub fn relayable_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP_RESPONSE_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Pulls an error code out of `{"error":{"code"|"type": ...}}` bodies.
pub fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
