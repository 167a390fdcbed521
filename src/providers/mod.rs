pub mod openai;
pub mod sse;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Lazy finite sequence of SSE text lines from an upstream stream.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// One entry of an upstream `/models` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamModel {
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
}

/// Per-upstream HTTP client. All upstreams speak OpenAI-compatible Chat
/// Completions; adapters differ in base URL, credentials and payload
/// normalization.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn list_models(&self) -> Result<Vec<UpstreamModel>, ProviderError>;

    /// Non-streaming chat completion. Non-2xx upstream status is an error
    /// carrying the upstream body for the logs.
    async fn chat_completions(&self, payload: Value) -> Result<Value, ProviderError>;

    /// Streaming chat completion. Non-2xx at stream start is an error; on
    /// success the returned stream yields SSE lines as the upstream sends
    /// them.
    async fn chat_completions_stream(&self, payload: Value) -> Result<LineStream, ProviderError>;
}

/// A registered provider: the adapter plus its model allow-list.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Empty = unrestricted.
    pub allowed_models: Vec<String>,
}

impl RegisteredProvider {
    pub fn allows(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Name → provider map resolved from configuration at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config, client: &reqwest::Client) -> Self {
        let mut providers = HashMap::new();

        if let Some(cfg) = &config.deepseek {
            // DeepSeek rejects typed content parts on tool messages
            providers.insert(
                "deepseek".to_string(),
                RegisteredProvider {
                    adapter: Arc::new(openai::OpenAiAdapter::new(
                        "deepseek",
                        cfg,
                        true,
                        client.clone(),
                    )),
                    allowed_models: cfg.allowed_models.clone(),
                },
            );
        }

        if let Some(cfg) = &config.moonshot {
            providers.insert(
                "moonshot".to_string(),
                RegisteredProvider {
                    adapter: Arc::new(openai::OpenAiAdapter::new(
                        "moonshot",
                        cfg,
                        false,
                        client.clone(),
                    )),
                    allowed_models: cfg.allowed_models.clone(),
                },
            );
        }

        if let Some(cfg) = &config.zai {
            providers.insert(
                "zai".to_string(),
                RegisteredProvider {
                    adapter: Arc::new(openai::OpenAiAdapter::new("zai", cfg, false, client.clone())),
                    allowed_models: cfg.allowed_models.clone(),
                },
            );
        }

        if let Some(cfg) = &config.test_provider {
            providers.insert(
                "test".to_string(),
                RegisteredProvider {
                    adapter: Arc::new(test::TestAdapter::new(cfg.chunk_size, cfg.delay_ms)),
                    allowed_models: Vec::new(),
                },
            );
        }

        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.providers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegisteredProvider)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let provider = RegisteredProvider {
            adapter: Arc::new(test::TestAdapter::new(8, 0)),
            allowed_models: Vec::new(),
        };
        assert!(provider.allows("anything"));
    }

    #[test]
    fn allow_list_filters_models() {
        let provider = RegisteredProvider {
            adapter: Arc::new(test::TestAdapter::new(8, 0)),
            allowed_models: vec!["deepseek-chat".into()],
        };
        assert!(provider.allows("deepseek-chat"));
        assert!(!provider.allows("deepseek-reasoner"));
    }
}
