//! Public introspection routes.

use std::sync::Arc;

use axum::{Router, routing::get};

use crate::handlers::api;
use crate::state::AppState;

/// `GET /healthz` and `GET /metrics`; both unauthenticated by design so
/// probes and scrapers work without credentials.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/metrics", get(api::metrics))
}
