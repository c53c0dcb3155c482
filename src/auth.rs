//! Stub bearer-token authentication.
//!
//! Disabled by default; when `AUTH_ENABLED` is set, `/api` requests must
//! carry `Authorization: Bearer <AUTH_TOKEN>`. This is a placeholder for a
//! real identity layer, which is out of scope.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::{ApiError, SharedState};

pub async fn require_auth(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.auth_enabled {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match (presented, state.config.auth_token.as_deref()) {
        (Some(token), Some(expected)) if token == expected => next.run(request).await,
        _ => ApiError::unauthorized("missing or invalid bearer token").into_response(),
    }
}
