use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::AppError;
use crate::services::key_service;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    key: String,
}

/// POST /internal/cache/invalidate — drop a cached key verdict so the next
/// request re-verifies against the authority. Called by the authority on
/// revocation for immediate propagation.
async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InvalidateRequest>,
) -> Result<StatusCode, AppError> {
    let mut redis = state.redis.clone();
    key_service::invalidate_cache(&body.key, &mut redis).await?;
    tracing::info!("Invalidated cached key entry");
    Ok(StatusCode::NO_CONTENT)
}

async fn health() -> &'static str {
    "OK"
}

/// Routes behind the shared-secret bearer.
pub fn protected_router() -> Router<Arc<AppState>> {
    Router::new().route("/cache/invalidate", post(invalidate_cache))
}

/// Unauthenticated liveness probe.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}
