//! API key authentication middleware.
//!
//! Keys arrive either as `Authorization: Bearer <key>` or as an
//! `?api_key=<key>` query parameter; browser WebSocket clients cannot set
//! headers, so the query fallback is mandatory. On the WebSocket route an
//! unauthenticated request still upgrades with a pending marker and gets an
//! `error{kind=auth_failed}` frame after the handshake, because a rejected
//! upgrade is invisible to browser clients.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ApiKey;
use crate::state::AppState;

/// Authentication outcome carried through request extensions.
#[derive(Debug, Clone)]
pub struct Auth {
    /// Matched key id; `None` when auth is disabled.
    pub id: Option<String>,
    pending: bool,
}

impl Auth {
    /// Auth disabled: every request passes with no identity.
    pub fn disabled() -> Self {
        Self {
            id: None,
            pending: false,
        }
    }

    pub fn authenticated(id: String) -> Self {
        Self {
            id: Some(id),
            pending: false,
        }
    }

    /// Credential missing or wrong on a WebSocket route; the handler must
    /// reject on the wire.
    pub fn pending() -> Self {
        Self {
            id: None,
            pending: true,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Matches a presented key against the configured entries, returning the
/// entry id. The comparison does not short-circuit on the first differing
/// byte.
pub fn match_api_key_id<'a>(presented: &str, keys: &'a [ApiKey]) -> Option<&'a str> {
    keys.iter()
        .find(|entry| constant_time_eq(entry.key.as_bytes(), presented.as_bytes()))
        .map(|entry| entry.id.as_str())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn extract_key(request: &Request) -> Option<String> {
    if let Some(header) = request.headers().get("authorization") {
        return header
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
    }

    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "api_key")
        .map(|(_, value)| value.into_owned())
}

fn is_ws_upgrade(request: &Request) -> bool {
    request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.config.auth_required() {
        request.extensions_mut().insert(Auth::disabled());
        return next.run(request).await;
    }

    let presented = extract_key(&request);
    let matched = presented
        .as_deref()
        .and_then(|key| match_api_key_id(key, &state.config.api_keys));

    match matched {
        Some(id) => {
            debug!(auth_id = %id, "api key accepted");
            request
                .extensions_mut()
                .insert(Auth::authenticated(id.to_string()));
            next.run(request).await
        }
        None if is_ws_upgrade(&request) => {
            // Let the upgrade complete; the handler sends auth_failed on
            // the wire where a browser client can actually see it.
            warn!("unauthenticated websocket upgrade, deferring rejection to the wire");
            request.extensions_mut().insert(Auth::pending());
            next.run(request).await
        }
        None => {
            warn!(path = %request.uri().path(), "rejecting unauthenticated request");
            (StatusCode::UNAUTHORIZED, "invalid or missing API key").into_response()
        }
    }
}
