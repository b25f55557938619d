use claude_multi_proxy::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,claude_multi_proxy=debug")
            }),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = claude_multi_proxy::app::load_state().await?;
    let app = claude_multi_proxy::app::build_app(state.clone());
    let listen = state.listen_addr();
    let addr: std::net::SocketAddr = listen.parse().map_err(|err: std::net::AddrParseError| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_invalid",
            format!("{}: {}", listen, err),
        )
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;

    let providers = &state.config.providers;
    tracing::info!(
        cerebras_models = ?providers.cerebras.models,
        codex_models = ?providers.codex.models,
        usage_log = %state.usage.path().display(),
        "listening on {}",
        addr
    );
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
