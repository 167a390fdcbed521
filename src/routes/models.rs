use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::AppError;
use crate::services::model_service;
use crate::state::AppState;

/// GET /v1/models — aggregated catalog across providers, public ids in
/// `provider/model` form.
async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let mut redis = state.redis.clone();
    let data = model_service::aggregate_models(&mut redis, &state.providers).await?;
    Ok(Json(json!({ "object": "list", "data": data })))
}

async fn ping() -> &'static str {
    "OK"
}

/// Build the catalog/ping router (nested under /v1).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/ping", get(ping).post(ping))
}
