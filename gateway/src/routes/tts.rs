//! WebSocket route configuration.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::tts::tts_handler;
use crate::state::AppState;

/// Creates the streaming router.
///
/// # Endpoint
///
/// `GET /tts` - WebSocket upgrade for the TTS streaming protocol.
///
/// # Protocol
///
/// The first client frame must be `start` (new session) or `resume`
/// (re-attach to an orphan). The server answers `start_ack`, then streams
/// `audio_chunk` frames with unit alignment metadata and finishes with a
/// single `tts_end`.
pub fn create_tts_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tts", get(tts_handler))
        .layer(TraceLayer::new_for_http())
}
