use serde::{Deserialize, Serialize};

/// Purpose declared on an API key; selects the request/response pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    #[default]
    Default,
    /// Clients that cannot read `reasoning_content` and need it folded into
    /// `content` as a `<think>` block.
    Cursor,
}

/// Key metadata as the authority defines it. Read-only at the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub user_id: i64,
    pub active: bool,
    #[serde(default)]
    pub purpose: Purpose,
}

/// Why a cached key entry holds no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTag {
    /// Authority said 403. Long TTL; billing-sensitive.
    Revoked,
    /// Authority said 404. Long TTL.
    NotFound,
    /// Authority unreachable or 5xx. Short TTL so an outage is not cached
    /// for an hour.
    Error,
}

/// The cached envelope stored under `apikey:<key>`. The tag is the
/// side channel that keeps a mapped-null distinct from a cache miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<CacheTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ApiKeyRecord>,
}

impl CachedKey {
    pub fn valid(record: ApiKeyRecord) -> Self {
        Self {
            tag: None,
            record: Some(record),
        }
    }

    pub fn negative(tag: CacheTag) -> Self {
        Self {
            tag: Some(tag),
            record: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Purpose::Cursor).unwrap(), "\"cursor\"");
        assert_eq!(serde_json::to_string(&Purpose::Default).unwrap(), "\"default\"");
    }

    #[test]
    fn purpose_defaults_when_absent() {
        let record: ApiKeyRecord =
            serde_json::from_str(r#"{"user_id": 7, "active": true}"#).unwrap();
        assert_eq!(record.purpose, Purpose::Default);
    }

    #[test]
    fn negative_envelope_round_trips_with_tag() {
        let entry = CachedKey::negative(CacheTag::NotFound);
        let json = serde_json::to_string(&entry).unwrap();
        let back: CachedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tag, Some(CacheTag::NotFound));
        assert!(back.record.is_none());
    }

    #[test]
    fn valid_envelope_carries_no_tag() {
        let entry = CachedKey::valid(ApiKeyRecord {
            user_id: 42,
            active: true,
            purpose: Purpose::Cursor,
        });
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("tag").is_none());
        assert_eq!(json["record"]["user_id"], 42);
    }
}
