use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secgate_api::{
    handlers::{csrf_token_handler, health_handler},
    middleware::{security_gate_middleware, security_headers_middleware},
    observability::{init_logging, init_metrics, metrics_handler, LogConfig},
    ConfigManager, SecurityGate,
};
use secgate_core::PresetName;
use tower_http::trace::TraceLayer;

mod config;

use config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;

    init_logging(&LogConfig {
        format: settings.log_format,
        level: settings.log_level.clone(),
        filter: None,
    })?;
    init_metrics()?;

    tracing::info!("Starting secgate server");

    let config = Arc::new(build_config_manager(&settings)?);
    tracing::info!(
        revision = config.revision(),
        "Security policy loaded"
    );

    let gate = Arc::new(SecurityGate::new(config));
    let _cleanup =
        gate.spawn_cleanup_tasks(settings.rate_limit_cleanup(), settings.token_cleanup());

    let app = router(gate);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_config_manager(settings: &Settings) -> Result<ConfigManager> {
    let preset = settings
        .preset
        .parse::<PresetName>()
        .unwrap_or_else(|_| PresetName::recommended_for(&settings.preset));
    let manager = ConfigManager::from_preset(preset)?;

    if let Some(path) = &settings.policy_file {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("reading policy file {}", path.display()))?;
        manager.import(&document, &format!("Imported from {}", path.display()))?;
    }

    Ok(manager)
}

fn router(gate: Arc<SecurityGate>) -> Router {
    let protected = Router::new()
        .route("/api/v1/csrf-token", get(csrf_token_handler))
        .route("/api/v1/echo", post(echo).get(echo))
        .layer(middleware::from_fn_with_state(
            gate.clone(),
            security_gate_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            gate.clone(),
            security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(gate)
}

async fn echo(body: String) -> String {
    body
}
