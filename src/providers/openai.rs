use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_json::Value;

use super::sse::sse_line_stream;
use super::{LineStream, ProviderAdapter, ProviderError, UpstreamModel};
use crate::config::UpstreamConfig;

/// Generic OpenAI-compatible upstream. Covers DeepSeek, Moonshot and Zai;
/// they differ only in base URL, credentials and whether tool-message
/// content parts must be flattened before dispatch.
pub struct OpenAiAdapter {
    name: &'static str,
    base_url: String,
    api_key: String,
    flatten_tool_content: bool,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ModelListBody {
    #[serde(default)]
    data: Vec<UpstreamModel>,
}

impl OpenAiAdapter {
    pub fn new(
        name: &'static str,
        cfg: &UpstreamConfig,
        flatten_tool_content: bool,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name,
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            flatten_tool_content,
            client,
        }
    }

    /// Payload normalization before dispatch.
    fn prepare(&self, mut payload: Value) -> Value {
        if self.flatten_tool_content {
            if let Some(messages) = payload.get_mut("messages").and_then(|m| m.as_array_mut()) {
                for message in messages {
                    let is_tool = message.get("role").and_then(|r| r.as_str()) == Some("tool");
                    if !is_tool {
                        continue;
                    }
                    if let Some(parts) = message.get("content").and_then(|c| c.as_array()) {
                        let flat = flatten_content_parts(parts);
                        message["content"] = Value::String(flat);
                    }
                }
            }
        }
        payload
    }

    async fn post_chat(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await?;
        Ok(resp)
    }
}

/// Flatten a list of typed content parts into a single string for upstreams
/// that only accept string content.
pub fn flatten_content_parts(parts: &[Value]) -> String {
    let mut out = String::new();
    for part in parts {
        match part.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                out.push_str(part.get("text").and_then(|t| t.as_str()).unwrap_or(""));
            }
            Some("image_url") => {
                let url = part
                    .pointer("/image_url/url")
                    .and_then(|u| u.as_str())
                    .unwrap_or("");
                out.push_str(&format!("[Image: {url}]"));
            }
            other => {
                let kind = other.unwrap_or("unknown");
                out.push_str(&format!("[Unsupported Multimodal Block: {kind}]"));
            }
        }
    }
    out
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        self.name
    }

    async fn list_models(&self) -> Result<Vec<UpstreamModel>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body: ModelListBody = resp.json().await?;
        Ok(body.data)
    }

    async fn chat_completions(&self, payload: Value) -> Result<Value, ProviderError> {
        let payload = self.prepare(payload);
        let resp = self.post_chat(&payload).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }

    async fn chat_completions_stream(&self, payload: Value) -> Result<LineStream, ProviderError> {
        let payload = self.prepare(payload);
        let resp = self.post_chat(&payload).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse_line_stream(resp.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(flatten: bool) -> OpenAiAdapter {
        OpenAiAdapter::new(
            "deepseek",
            &UpstreamConfig {
                api_key: "sk-test".into(),
                base_url: "http://localhost:1".into(),
                allowed_models: Vec::new(),
            },
            flatten,
            reqwest::Client::new(),
        )
    }

    #[test]
    fn flattens_text_and_image_parts() {
        let parts = vec![
            json!({"type": "text", "text": "look at "}),
            json!({"type": "image_url", "image_url": {"url": "http://x/y.png"}}),
            json!({"type": "audio", "data": "..."}),
        ];
        assert_eq!(
            flatten_content_parts(&parts),
            "look at [Image: http://x/y.png][Unsupported Multimodal Block: audio]"
        );
    }

    #[test]
    fn prepare_flattens_only_tool_messages() {
        let payload = json!({
            "model": "deepseek-chat",
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "tool", "tool_call_id": "1",
                 "content": [{"type": "text", "text": "result"}]},
            ]
        });

        let prepared = adapter(true).prepare(payload);
        let messages = prepared["messages"].as_array().unwrap();
        assert!(messages[0]["content"].is_array());
        assert_eq!(messages[1]["content"], "result");
    }

    #[test]
    fn prepare_is_identity_without_flattening() {
        let payload = json!({
            "messages": [
                {"role": "tool", "content": [{"type": "text", "text": "result"}]},
            ]
        });
        let prepared = adapter(false).prepare(payload.clone());
        assert_eq!(prepared, payload);
    }
}
