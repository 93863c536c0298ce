//! Introspection endpoints: health and metrics.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Engine as configured (`WS_TTS_ENGINE`).
    pub engine: String,
    /// Engine actually constructed.
    pub engine_resolved: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_sample_rate: Option<u32>,
    pub uptime_s: f64,
    pub sessions_active: usize,
}

/// `GET /healthz`
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.config.engine.clone(),
        engine_resolved: state.engine.name(),
        model_sample_rate: state.engine.native_sample_rate(),
        uptime_s: state.uptime_s(),
        sessions_active: state.registry.active_count(),
    })
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let payload = state
        .metrics
        .render_prometheus(state.registry.active_count());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        payload,
    )
        .into_response()
}
