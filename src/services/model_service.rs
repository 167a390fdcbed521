use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::providers::ProviderRegistry;

const MODELS_CACHE_KEY: &str = "models_list";
const MODELS_TTL_SECS: u64 = 300;

/// One entry of the public `/v1/models` catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Public id in `provider/model` form.
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// The aggregated model catalog across providers, cache-aside in Redis.
///
/// On a miss, every provider is queried concurrently; each returned model id
/// is prefixed with its provider name and filtered by the provider's
/// allow-list. Provider failures degrade to partial results, and an empty
/// aggregate is never cached. Cache failures are tolerated in both
/// directions.
pub async fn aggregate_models(
    redis: &mut ConnectionManager,
    providers: &ProviderRegistry,
) -> Result<Vec<ModelInfo>, AppError> {
    // Fast path: check Redis
    let cached: Result<Option<String>, _> = redis.get(MODELS_CACHE_KEY).await;
    match cached {
        Ok(Some(json_str)) => {
            if let Ok(models) = serde_json::from_str::<Vec<ModelInfo>>(&json_str) {
                return Ok(models);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Model catalog cache read failed: {}", e),
    }

    // Query every provider concurrently; tolerate per-provider failures
    let listings = futures::future::join_all(providers.iter().map(|(name, provider)| {
        let name = name.clone();
        let provider = provider.clone();
        async move {
            let result = provider.adapter.list_models().await;
            (name, provider, result)
        }
    }))
    .await;

    let mut models = Vec::new();
    for (name, provider, result) in listings {
        match result {
            Ok(list) => {
                for model in list {
                    if !provider.allows(&model.id) {
                        continue;
                    }
                    models.push(ModelInfo {
                        id: format!("{name}/{}", model.id),
                        object: "model".to_string(),
                        created: model.created,
                        owned_by: model.owned_by,
                    });
                }
            }
            Err(e) => tracing::warn!("Model listing from provider {} failed: {}", name, e),
        }
    }

    if !models.is_empty() {
        if let Ok(json_str) = serde_json::to_string(&models) {
            let write: Result<(), _> = redis
                .set_ex(MODELS_CACHE_KEY, json_str, MODELS_TTL_SECS)
                .await;
            if let Err(e) = write {
                tracing::warn!("Model catalog cache write failed: {}", e);
            }
        }
    }

    Ok(models)
}
