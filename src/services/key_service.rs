use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;

use crate::config::Config;
use crate::error::AppError;
use crate::models::api_key::{ApiKeyRecord, CacheTag, CachedKey, Purpose};

const KEY_CACHE_PREFIX: &str = "apikey:";

/// TTL for a verified key.
const VALID_TTL_SECS: u64 = 600;
/// TTL for revoked / absent keys. Long: these are billing-sensitive.
const NEGATIVE_TTL_SECS: u64 = 3600;
/// TTL for authority failures. Short, so a dead authority is not cached
/// for an hour.
const ERROR_TTL_SECS: u64 = 60;

fn cache_key(key: &str) -> String {
    format!("{KEY_CACHE_PREFIX}{key}")
}

/// Authority response for `/internal/keys/verify`.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[allow(dead_code)]
    key_value: Option<String>,
    user_id: i64,
    is_active: bool,
    #[serde(default)]
    purpose: Purpose,
}

/// Look up key metadata, cache-aside against the authority.
///
/// Fast path: the Redis envelope under `apikey:<key>`. A tagged envelope is
/// a negative hit (revoked / absent / transient error) and short-circuits to
/// None without touching the authority. On a miss, the authority verdict is
/// cached with a TTL matching its kind.
pub async fn get_api_key(
    key: &str,
    redis: &mut ConnectionManager,
    http_client: &reqwest::Client,
    config: &Config,
) -> Result<Option<ApiKeyRecord>, AppError> {
    let cache_field = cache_key(key);

    // Fast path: check Redis
    let cached: Option<String> = redis.get(&cache_field).await?;
    if let Some(json_str) = cached {
        if let Ok(entry) = serde_json::from_str::<CachedKey>(&json_str) {
            if entry.tag.is_some() {
                return Ok(None);
            }
            if let Some(record) = entry.record {
                return Ok(Some(record));
            }
        }
        // Unreadable envelope: fall through to the authority
    }

    // Slow path: ask the authority and cache its verdict
    let verdict = verify_with_authority(key, http_client, config).await;
    let (entry, ttl, record) = match verdict {
        Ok(VerifyOutcome::Valid(record)) => (
            CachedKey::valid(record.clone()),
            VALID_TTL_SECS,
            Some(record),
        ),
        Ok(VerifyOutcome::Revoked) => (
            CachedKey::negative(CacheTag::Revoked),
            NEGATIVE_TTL_SECS,
            None,
        ),
        Ok(VerifyOutcome::NotFound) => (
            CachedKey::negative(CacheTag::NotFound),
            NEGATIVE_TTL_SECS,
            None,
        ),
        Err(e) => {
            tracing::warn!("Key verification against authority failed: {}", e);
            (CachedKey::negative(CacheTag::Error), ERROR_TTL_SECS, None)
        }
    };

    if let Ok(json_str) = serde_json::to_string(&entry) {
        let write: Result<(), _> = redis.set_ex(&cache_field, json_str, ttl).await;
        if let Err(e) = write {
            tracing::warn!("Failed to cache key verdict: {}", e);
        }
    }

    Ok(record)
}

/// Drop the cached entry so the next read goes to the authority.
pub async fn invalidate_cache(
    key: &str,
    redis: &mut ConnectionManager,
) -> Result<(), AppError> {
    let _: () = redis.del(cache_key(key)).await?;
    Ok(())
}

enum VerifyOutcome {
    Valid(ApiKeyRecord),
    Revoked,
    NotFound,
}

async fn verify_with_authority(
    key: &str,
    http_client: &reqwest::Client,
    config: &Config,
) -> Result<VerifyOutcome, AppError> {
    let resp = http_client
        .post(format!("{}/internal/keys/verify", config.backend_url))
        .bearer_auth(&config.internal_secret)
        .json(&serde_json::json!({ "key": key }))
        .send()
        .await?;

    match resp.status().as_u16() {
        s if (200..300).contains(&s) => {
            let body: VerifyResponse = resp.json().await?;
            Ok(VerifyOutcome::Valid(ApiKeyRecord {
                user_id: body.user_id,
                active: body.is_active,
                purpose: body.purpose,
            }))
        }
        403 => Ok(VerifyOutcome::Revoked),
        404 => Ok(VerifyOutcome::NotFound),
        s => Err(AppError::Internal(format!(
            "authority verify returned status {s}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_prefixed() {
        assert_eq!(cache_key("sk-abc"), "apikey:sk-abc");
    }

    #[test]
    fn verify_response_parses_authority_shape() {
        let body: VerifyResponse = serde_json::from_str(
            r#"{"key_value": "sk-abc", "user_id": 12, "is_active": true, "purpose": "cursor"}"#,
        )
        .unwrap();
        assert_eq!(body.user_id, 12);
        assert!(body.is_active);
        assert_eq!(body.purpose, Purpose::Cursor);
    }

    #[test]
    fn tagged_envelope_reads_as_negative() {
        let json_str =
            serde_json::to_string(&CachedKey::negative(CacheTag::Revoked)).unwrap();
        let entry: CachedKey = serde_json::from_str(&json_str).unwrap();
        assert!(entry.tag.is_some());
        assert!(entry.record.is_none());
    }
}
