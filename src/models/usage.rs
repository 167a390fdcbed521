use serde::{Deserialize, Serialize};

use crate::models::api_key::Purpose;

/// Normalized token usage in the canonical OpenAI field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

/// One settlement record per finished request. Serialized camelCase for the
/// authority's `/internal/usage/settle` wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub request_id: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Purpose>,
    pub provider_name: String,
    /// Public model name, with the provider prefix.
    pub model_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub total_tokens: u64,
    pub is_estimated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_uses_camel_case_wire_names() {
        let entry = UsageLogEntry {
            request_id: "chatcmpl-abc".into(),
            timestamp_ms: 1_700_000_000_000,
            user_id: Some(3),
            purpose: Some(Purpose::Default),
            provider_name: "deepseek".into(),
            model_name: "deepseek/deepseek-chat".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            cached_tokens: 0,
            total_tokens: 15,
            is_estimated: false,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["requestId"], "chatcmpl-abc");
        assert_eq!(json["timestampMs"], 1_700_000_000_000i64);
        assert_eq!(json["providerName"], "deepseek");
        assert_eq!(json["isEstimated"], false);
        assert_eq!(json["promptTokens"], 10);
    }

    #[test]
    fn optional_identity_fields_are_omitted() {
        let entry = UsageLogEntry {
            request_id: "chatcmpl-abc".into(),
            timestamp_ms: 0,
            user_id: None,
            purpose: None,
            provider_name: "test".into(),
            model_name: "test/echo".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            cached_tokens: 0,
            total_tokens: 2,
            is_estimated: true,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("userId").is_none());
        assert!(json.get("purpose").is_none());
    }
}
