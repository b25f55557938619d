use crate::app::AppState;
use crate::canonical::CanonicalRequest;
use crate::canonical::decode::{ChatStreamConverter, ResponsesStreamConverter, UpstreamConverter};
use crate::canonical::encode::{openai_chat, responses};
use crate::config::{DEFAULT_ANTHROPIC_URL, DEFAULT_CEREBRAS_URL, DEFAULT_CODEX_URL};
use crate::error::{AppError, AppResult};
use crate::relay::{body_channel, relay_converted, relay_passthrough};
use crate::router::{self, Provider, UNKNOWN_MODEL};
use crate::upstream;
use crate::usage::extract_usage;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_messages(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let raw: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let req = CanonicalRequest::from_value(&raw);
    let route = router::route(&req, &state.config);
    tracing::info!(provider = %route.provider, model = %route.model, "routing request");
    metrics::counter!("proxy_requests_total", "provider" => route.provider.as_str()).increment(1);

    match route.provider {
        Provider::Anthropic => forward_anthropic(&state, method, &uri, &headers, body, route.model).await,
        Provider::Cerebras => stream_cerebras(&state, &req, route.model).await,
        Provider::Codex => stream_codex(&state, &req, route.model).await,
    }
}

/// Token counting is always answered by anthropic.
pub async fn count_tokens(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let model = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(|s| s.to_string()))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
    forward_anthropic(&state, method, &uri, &headers, body, model).await
}

pub async fn list_usage(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let entries = state.usage.list().await.map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "usage_read_failed",
            err.to_string(),
        )
    })?;
    Ok(Json(json!({
        "entries": entries,
        "costs": state.config.usage.costs,
    })))
}

async fn forward_anthropic(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    model: String,
) -> AppResult<Response> {
    let base_url = state.config.providers.anthropic.endpoint(DEFAULT_ANTHROPIC_URL);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let upstream = upstream::forward_raw(&state.http, base_url, method, path, headers, body)
        .await
        .map_err(|err| {
            tracing::warn!(provider = "anthropic", error = %err, "upstream connect failed");
            AppError::from_upstream("anthropic", err)
        })?;

    let status = upstream.status();
    let response_headers = upstream::relayable_response_headers(upstream.headers());
    let (tx, rx) = body_channel();
    let usage = state.usage.clone();
    tokio::spawn(async move {
        let copy = relay_passthrough(upstream.bytes_stream(), tx).await;
        if let Some(entry) = extract_usage(&copy, Provider::Anthropic.as_str(), &model) {
            usage.log(entry);
        }
    });

    let mut response = Response::new(Body::from_stream(rx));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

async fn stream_cerebras(state: &AppState, req: &CanonicalRequest, model: String) -> AppResult<Response> {
    let provider = &state.config.providers.cerebras;
    let mut body = openai_chat::encode_request(req);
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.clone()));
        obj.insert("stream".to_string(), Value::Bool(true));
    }
    let api_key = provider.api_key.as_deref().unwrap_or("");
    let upstream = upstream::post_json(
        &state.http,
        provider.endpoint(DEFAULT_CEREBRAS_URL),
        api_key,
        &[],
        &body,
    )
    .await
    .map_err(|err| {
        tracing::warn!(provider = "cerebras", status = ?err.status, error = %err, "upstream call failed");
        AppError::from_upstream("cerebras", err)
    })?;

    let converter = UpstreamConverter::Chat(ChatStreamConverter::new(model.clone()));
    Ok(stream_converted(state, Provider::Cerebras, model, upstream, converter))
}

async fn stream_codex(state: &AppState, req: &CanonicalRequest, model: String) -> AppResult<Response> {
    let provider = &state.config.providers.codex;
    let token = state.credentials.get_token().await.map_err(|err| {
        tracing::warn!(provider = "codex", error = %err, "credentials unavailable");
        AppError::from(err)
    })?;
    let body = responses::encode_request(req, &model, provider.strict_tools);
    let upstream = upstream::post_json(
        &state.http,
        provider.endpoint(DEFAULT_CODEX_URL),
        &token.access_token,
        &[("chatgpt-account-id", token.account_id.as_str())],
        &body,
    )
    .await
    .map_err(|err| {
        tracing::warn!(provider = "codex", status = ?err.status, error = %err, "upstream call failed");
        AppError::from_upstream("codex", err)
    })?;

    let converter = UpstreamConverter::Responses(ResponsesStreamConverter::new(model.clone()));
    Ok(stream_converted(state, Provider::Codex, model, upstream, converter))
}

/// Answers with a canonical SSE stream fed by a relay task that owns the
/// converter, then logs usage from whatever was written.
fn stream_converted(
    state: &AppState,
    provider: Provider,
    model: String,
    upstream: reqwest::Response,
    converter: UpstreamConverter,
) -> Response {
    let (tx, rx) = body_channel();
    let usage = state.usage.clone();
    tokio::spawn(async move {
        let transcript = relay_converted(upstream.bytes_stream(), converter, tx).await;
        match extract_usage(&transcript, provider.as_str(), &model) {
            Some(entry) => usage.log(entry),
            None => tracing::debug!(%provider, %model, "stream reported no usage"),
        }
    });

    let mut response = Response::new(Body::from_stream(rx));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
