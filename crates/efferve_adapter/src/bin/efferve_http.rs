#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use efferve_adapter::{init_tracing, AdapterHealthResponse, AdapterRuntime, AdapterStatusResponse};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let bind = env::var("EFFERVE_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = Arc::new(AdapterRuntime::default_from_env()?);
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .with_state(runtime.clone());

    info!(%addr, "efferve_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "ctrl-c handler failed; shutting down");
            }
        })
        .await?;

    if let Some(summary) = runtime.shutdown().await {
        info!(
            aborted_sources = summary.aborted_sources,
            delivered = summary.dispatch.delivered,
            failed = summary.dispatch.failed,
            "efferve stopped"
        );
    }
    Ok(())
}

async fn healthz(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    match runtime.health_report() {
        Ok(response) if response.degraded_sources.is_empty() => (StatusCode::OK, Json(response)),
        Ok(response) => (StatusCode::SERVICE_UNAVAILABLE, Json(response)),
        Err(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(reason),
                degraded_sources: Vec::new(),
                disabled_rules: 0,
            }),
        ),
    }
}

async fn status(
    State(runtime): State<Arc<AdapterRuntime>>,
) -> Result<Json<AdapterStatusResponse>, (StatusCode, String)> {
    runtime
        .status_report()
        .map(Json)
        .map_err(|reason| (StatusCode::INTERNAL_SERVER_ERROR, reason))
}
