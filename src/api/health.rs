//! `GET /health`: store connectivity and credential-pool size.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use super::routes::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    store_connected: bool,
    active_credentials: usize,
    uptime_seconds: f64,
    version: &'static str,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_connected = state.store.ping().await;
    let active_credentials = if store_connected {
        state.registry.active_count().await.unwrap_or(0)
    } else {
        0
    };

    Json(HealthResponse {
        status: if store_connected { "ok" } else { "degraded" },
        store_connected,
        active_credentials,
        uptime_seconds: (state.started_at.elapsed().as_millis() as f64 / 100.0).round() / 10.0,
        version: env!("CARGO_PKG_VERSION"),
    })
}
