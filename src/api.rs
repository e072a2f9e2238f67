use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::clients::health::HealthChecker;

/// `/health` reports the stores and dispatch backlog, `/health/live` only
/// answers that the process is up.
pub fn router(health_checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(readiness))
        .route("/health/live", get(|| async { StatusCode::NO_CONTENT }))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(health_checker))
}

pub async fn run_api_server(health_checker: HealthChecker, port: u16) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;

    info!(address = %addr, "Health check server started");

    axum::serve(listener, router(health_checker))
        .await
        .map_err(|e| anyhow!("Health check server failed: {}", e))?;

    Ok(())
}

async fn readiness(State(checker): State<Arc<HealthChecker>>) -> impl IntoResponse {
    let health = checker.check_all().await;

    let status_code = if health.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}
