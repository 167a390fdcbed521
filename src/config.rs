use std::env;

/// Per-upstream provider settings. A provider is registered only when its
/// API key is present in the environment.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub base_url: String,
    /// Model ids this provider may serve. Empty = unrestricted.
    pub allowed_models: Vec<String>,
}

/// Settings for the synthetic test provider (no paid upstream).
#[derive(Debug, Clone)]
pub struct TestProviderConfig {
    /// Characters per synthetic stream chunk.
    pub chunk_size: usize,
    /// Delay between synthetic stream chunks, in milliseconds.
    pub delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub redis_url: String,
    /// Base URL of the authority service (key verification + settlement).
    pub backend_url: String,
    /// Bearer secret for authority calls and the local internal surface.
    pub internal_secret: String,
    /// Comma-separated list of allowed CORS origins, or "*" for any.
    pub cors_origin: String,
    pub deepseek: Option<UpstreamConfig>,
    pub moonshot: Option<UpstreamConfig>,
    pub zai: Option<UpstreamConfig>,
    pub test_provider: Option<TestProviderConfig>,
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Read one provider's settings from `{PREFIX}_API_KEY`, `{PREFIX}_BASE_URL`
/// and `{PREFIX}_ALLOWED_MODELS`. Returns None when the key is unset.
fn upstream_from_env(prefix: &str, default_base_url: &str) -> Option<UpstreamConfig> {
    let api_key = env::var(format!("{prefix}_API_KEY")).ok()?;
    if api_key.trim().is_empty() {
        return None;
    }

    let base_url = env::var(format!("{prefix}_BASE_URL"))
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| default_base_url.to_string());

    let allowed_models = env::var(format!("{prefix}_ALLOWED_MODELS"))
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(UpstreamConfig {
        api_key,
        base_url,
        allowed_models,
    })
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let test_provider = if parse_bool_env("TEST_PROVIDER_ENABLED", false) {
            Some(TestProviderConfig {
                chunk_size: env::var("TEST_PROVIDER_CHUNK_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(16),
                delay_ms: env::var("TEST_PROVIDER_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            })
        } else {
            None
        };

        Ok(Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".into()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            backend_url: env::var("BACKEND_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .map_err(|_| anyhow::anyhow!("BACKEND_URL is required"))?,
            internal_secret: env::var("INTERNAL_SECRET")
                .map_err(|_| anyhow::anyhow!("INTERNAL_SECRET is required"))?,
            cors_origin: env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".into()),
            deepseek: upstream_from_env("DEEPSEEK", "https://api.deepseek.com/v1"),
            moonshot: upstream_from_env("MOONSHOT", "https://api.moonshot.cn/v1"),
            zai: upstream_from_env("ZAI", "https://api.z.ai/api/paas/v4"),
            test_provider,
        })
    }
}
