pub mod api;
pub mod tts;

use std::sync::Arc;

use axum::{Router, middleware};
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::auth_middleware;
use crate::state::AppState;

/// Assembles the full application: public introspection routes plus the
/// authenticated WebSocket route, with CORS according to configuration.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_routes = tts::create_tts_router().layer(middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    let router = api::create_api_router().merge(ws_routes);

    let router = match cors_layer(state.config.cors_allowed_origins.as_deref()) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router.with_state(state)
}

fn cors_layer(origins: Option<&str>) -> Option<CorsLayer> {
    let origins = origins?;
    if origins == "*" {
        Some(CorsLayer::new().allow_origin(Any))
    } else {
        let parsed: Vec<axum::http::HeaderValue> = origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        Some(CorsLayer::new().allow_origin(parsed))
    }
}
