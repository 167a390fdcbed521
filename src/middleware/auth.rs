use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::AppError;
use crate::services::key_service;
use crate::state::AppState;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware for `/v1/*`: validates the API key through the cache-aside
/// key store and injects the `ApiKeyRecord` into request extensions.
pub async fn api_key_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let token = match extract_bearer(&req) {
        Some(t) => t.to_string(),
        None => return AppError::Unauthorized.into_response(),
    };

    let mut redis = state.redis.clone();
    match key_service::get_api_key(&token, &mut redis, &state.http_client, &state.config).await {
        Ok(Some(record)) if record.active => {
            let mut req = req;
            req.extensions_mut().insert(record);
            next.run(req).await
        }
        Ok(_) => AppError::Unauthorized.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Middleware for the protected internal surface: shared-secret bearer.
pub async fn internal_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    match extract_bearer(&req) {
        Some(token) if token == state.config.internal_secret => next.run(req).await,
        _ => AppError::Unauthorized.into_response(),
    }
}
