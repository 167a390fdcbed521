use chrono::Utc;
use serde_json::Value;

use crate::models::api_key::Purpose;
use crate::models::usage::{Usage, UsageLogEntry};

/// Normalize upstream usage to the canonical four fields. Upstreams report
/// cached tokens under several names; the first present source wins.
/// Returns None (with a warning) when prompt or completion is missing, so
/// the caller can fall back to estimation.
pub fn normalize_usage(raw: &Value) -> Option<Usage> {
    let prompt = raw.get("prompt_tokens").and_then(|v| v.as_u64());
    let completion = raw.get("completion_tokens").and_then(|v| v.as_u64());

    let (Some(prompt_tokens), Some(completion_tokens)) = (prompt, completion) else {
        tracing::warn!("Upstream usage missing prompt or completion tokens: {}", raw);
        return None;
    };

    let total_tokens = raw
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens + completion_tokens);

    let cached_tokens = raw
        .get("cached_tokens")
        .and_then(|v| v.as_u64())
        .or_else(|| raw.pointer("/prompt_tokens_details/cached_tokens").and_then(|v| v.as_u64()))
        .or_else(|| raw.get("prompt_cache_hit_tokens").and_then(|v| v.as_u64()))
        .unwrap_or(0);

    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cached_tokens,
    })
}

/// Character-based token estimate: two characters per token, floor of one.
pub fn estimate_tokens_from_chars(chars: usize) -> u64 {
    (((chars as u64) + 1) / 2).max(1)
}

fn content_chars(message: &Value) -> usize {
    message
        .get("content")
        .and_then(|c| serde_json::to_string(c).ok())
        .map(|s| s.chars().count())
        .unwrap_or(0)
}

/// Estimate prompt tokens from the serialized message contents.
pub fn estimate_prompt_tokens(messages: &[Value]) -> u64 {
    let chars: usize = messages.iter().map(content_chars).sum();
    estimate_tokens_from_chars(chars)
}

/// Estimate a full usage block when the upstream was silent: prompt from the
/// request messages, completion from the serialized first choice.
pub fn estimate_usage(messages: &[Value], completion_choice: &Value) -> Usage {
    let prompt_tokens = estimate_prompt_tokens(messages);
    let completion_chars = serde_json::to_string(completion_choice)
        .map(|s| s.chars().count())
        .unwrap_or(0);
    let completion_tokens = estimate_tokens_from_chars(completion_chars);

    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cached_tokens: 0,
    }
}

/// Build the settlement record for a finished request.
#[allow(clippy::too_many_arguments)]
pub fn create_usage_log(
    request_id: &str,
    user_id: Option<i64>,
    purpose: Option<Purpose>,
    provider_name: &str,
    model_name: &str,
    usage: Usage,
    is_estimated: bool,
) -> UsageLogEntry {
    UsageLogEntry {
        request_id: request_id.to_string(),
        timestamp_ms: Utc::now().timestamp_millis(),
        user_id,
        purpose,
        provider_name: provider_name.to_string(),
        model_name: model_name.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        cached_tokens: usage.cached_tokens,
        total_tokens: usage.total_tokens,
        is_estimated,
    }
}
