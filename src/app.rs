use crate::codex_auth::{CodexAuth, CredentialProvider};
use crate::config::{Config, DEFAULT_CONFIG_PATH, resolve_home_path};
use crate::error::{AppError, AppResult};
use crate::usage::UsageLogger;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Inbound bodies carry whole conversations, images included.
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub usage: UsageLogger,
    pub credentials: Arc<dyn CredentialProvider>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    /// Overrides `127.0.0.1:<port>` when set.
    pub listen: Option<String>,
    pub metrics_path: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let config_path = non_empty_env("CLAUDE_MULTI_PROXY_CONFIG")
            .map(|p| resolve_home_path(&p))
            .unwrap_or_else(|| resolve_home_path(DEFAULT_CONFIG_PATH));
        let metrics_path = non_empty_env("CLAUDE_MULTI_PROXY_METRICS_PATH")
            .unwrap_or_else(|| "/metrics".to_string());
        Self {
            config_path,
            listen: non_empty_env("CLAUDE_MULTI_PROXY_LISTEN"),
            metrics_path,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_path: resolve_home_path(DEFAULT_CONFIG_PATH),
            listen: None,
            metrics_path: "/metrics".to_string(),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppState {
    pub fn listen_addr(&self) -> String {
        self.runtime
            .listen
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.config.port))
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let path = runtime.config_path.clone();
    let config = tokio::task::spawn_blocking(move || Config::load(&path))
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_load_failed",
                err.to_string(),
            )
        })?;
    build_state(runtime, config)
}

/// Wires the shared client, usage log and codex credentials for `config`.
pub fn build_state(runtime: RuntimeConfig, config: Config) -> AppResult<AppState> {
    let http = crate::upstream::build_client().map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "http_client_init_failed",
            err.to_string(),
        )
    })?;
    let metrics = init_metrics()?;
    let usage = UsageLogger::new(config.usage_log_path());
    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(CodexAuth::new(config.codex_auth_path(), http.clone()));

    Ok(AppState {
        runtime: Arc::new(runtime),
        config: Arc::new(config),
        http,
        metrics,
        usage,
        credentials,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let usage_api = Router::new()
        .route("/api/usage", get(crate::handlers::list_usage))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        );

    Router::<AppState>::new()
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route(
            "/v1/messages/count_tokens",
            post(crate::handlers::count_tokens),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .merge(usage_api)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
