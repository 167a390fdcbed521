use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::{ApiKeyRecord, Purpose};
use crate::pipeline::{Pipeline, StreamTransform};
use crate::providers::{LineStream, ProviderError, RegisteredProvider};
use crate::services::settlement::UsageQueue;
use crate::services::stream_tracker::StreamTracker;
use crate::services::usage_service;
use crate::state::AppState;

/// Downstream SSE channel capacity. The pump blocks on a full channel, so a
/// slow client throttles the upstream pull instead of growing a buffer.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Context threaded through one chat request.
#[derive(Debug, Clone)]
struct RequestCtx {
    request_id: String,
    provider_name: String,
    /// Public `provider/model` name; rewritten into every outgoing event.
    public_model: String,
    chat_history: Vec<Value>,
    user_id: Option<i64>,
    purpose: Purpose,
}

/// POST /v1/chat/completions — resolve the provider from the model prefix,
/// run the purpose pipeline, and proxy either path.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<ApiKeyRecord>,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut payload: Value =
        serde_json::from_slice(&body).map_err(|e| AppError::InvalidBody(e.to_string()))?;

    // The public model name is "<provider>/<model>"
    let model_field = payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let Some((provider_name, real_model)) = model_field.split_once('/') else {
        return Err(AppError::ModelNotFound);
    };

    let provider = state
        .providers
        .get(provider_name)
        .cloned()
        .ok_or(AppError::ModelNotFound)?;
    if !provider.allows(real_model) {
        return Err(AppError::ModelNotFound);
    }

    let is_stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let request_id = generate_request_id();
    let pipeline = Pipeline::for_purpose(key.purpose);

    payload["model"] = Value::String(real_model.to_string());

    // Many OpenAI-compatible providers only report usage on streams when
    // stream_options asks for it
    if is_stream && payload.get("stream_options").is_none() {
        payload["stream_options"] = json!({ "include_usage": true });
    }

    let payload = pipeline.preprocess(payload);
    let chat_history = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    let ctx = RequestCtx {
        request_id,
        provider_name: provider_name.to_string(),
        public_model: format!("{provider_name}/{real_model}"),
        chat_history,
        user_id: Some(key.user_id),
        purpose: key.purpose,
    };

    if is_stream {
        stream_chat(&state, provider, pipeline, ctx, payload).await
    } else {
        non_stream_chat(&state, provider, pipeline, ctx, payload).await
    }
}

fn map_upstream_err(ctx_request_id: &str, e: ProviderError) -> AppError {
    AppError::Upstream(format!("request {ctx_request_id}: {e}"))
}

// ── Non-stream path ───────────────────────────────────────────────────

async fn non_stream_chat(
    state: &AppState,
    provider: RegisteredProvider,
    pipeline: Pipeline,
    ctx: RequestCtx,
    payload: Value,
) -> Result<Response, AppError> {
    let raw = provider
        .adapter
        .chat_completions(payload)
        .await
        .map_err(|e| map_upstream_err(&ctx.request_id, e))?;

    let raw_usage = raw.get("usage").cloned();
    let first_choice = raw.pointer("/choices/0").cloned().unwrap_or(Value::Null);

    let mut processed = pipeline.postprocess(raw);
    processed["id"] = Value::String(ctx.request_id.clone());
    processed["model"] = Value::String(ctx.public_model.clone());

    let (usage, is_estimated) = match raw_usage.as_ref().and_then(usage_service::normalize_usage) {
        Some(usage) => (usage, false),
        None => (
            usage_service::estimate_usage(&ctx.chat_history, &first_choice),
            true,
        ),
    };
    processed["usage"] =
        serde_json::to_value(usage).map_err(|e| AppError::Internal(e.to_string()))?;

    // Accounting never blocks the response
    state.usage_queue.enqueue(usage_service::create_usage_log(
        &ctx.request_id,
        ctx.user_id,
        Some(ctx.purpose),
        &ctx.provider_name,
        &ctx.public_model,
        usage,
        is_estimated,
    ));

    Ok(Json(processed).into_response())
}

// ── Stream path ───────────────────────────────────────────────────────

async fn stream_chat(
    state: &AppState,
    provider: RegisteredProvider,
    pipeline: Pipeline,
    ctx: RequestCtx,
    payload: Value,
) -> Result<Response, AppError> {
    let lines = provider
        .adapter
        .chat_completions_stream(payload)
        .await
        .map_err(|e| map_upstream_err(&ctx.request_id, e))?;

    let estimated_prompt = usage_service::estimate_prompt_tokens(&ctx.chat_history);
    let transformer = pipeline.transformer();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(pump_stream(
        lines,
        tx,
        transformer,
        ctx,
        estimated_prompt,
        state.usage_queue.clone(),
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Pull upstream lines, rewrite them, and push SSE frames downstream.
///
/// Every way out of the loop — upstream end, client disconnect (observed as
/// a failed channel send), upstream error — funnels into the single
/// finalize block below, which builds and enqueues the usage record exactly
/// once.
async fn pump_stream(
    mut lines: LineStream,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    mut transformer: StreamTransform,
    ctx: RequestCtx,
    estimated_prompt: u64,
    queue: UsageQueue,
) {
    let mut tracker = StreamTracker::new();

    let reason = 'pump: loop {
        let Some(item) = lines.next().await else {
            break 'pump "flush";
        };
        match item {
            Ok(line) => {
                for frame in process_line(&line, &ctx, &mut tracker, &mut transformer) {
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        // Client went away; stop pulling from upstream
                        break 'pump "abort";
                    }
                }
            }
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, "Upstream stream error: {}", e);
                break 'pump "upstream_error";
            }
        }
    };

    // Single exit from the loop above, so this runs exactly once per stream
    // no matter which of flush / abort / upstream error ended it
    let usage = tracker.build_usage(estimated_prompt, 0);
    let is_estimated = !tracker.has_received_usage();
    queue.enqueue(usage_service::create_usage_log(
        &ctx.request_id,
        ctx.user_id,
        Some(ctx.purpose),
        &ctx.provider_name,
        &ctx.public_model,
        usage,
        is_estimated,
    ));
    tracing::debug!(
        request_id = %ctx.request_id,
        reason,
        is_estimated,
        "Stream finalized"
    );
}

/// Rewrite one upstream SSE line into zero or more downstream frames.
///
/// Non-event lines and `[DONE]` pass through verbatim; unparseable payloads
/// pass through with a warning. Event payloads get the public id and model
/// forced in, feed the tracker, latch actual usage, and then fan out
/// through the transformer.
fn process_line(
    line: &str,
    ctx: &RequestCtx,
    tracker: &mut StreamTracker,
    transformer: &mut StreamTransform,
) -> Vec<String> {
    let trimmed = line.trim();
    let Some(data) = trimmed.strip_prefix("data:") else {
        return vec![format!("{trimmed}\n\n")];
    };

    let data = data.trim_start();
    if data == "[DONE]" {
        return vec!["data: [DONE]\n\n".to_string()];
    }

    let mut event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                "Unparseable SSE payload, forwarding verbatim: {}",
                e
            );
            return vec![format!("{trimmed}\n\n")];
        }
    };
    if !event.is_object() {
        return vec![format!("{trimmed}\n\n")];
    }

    event["id"] = Value::String(ctx.request_id.clone());
    event["model"] = Value::String(ctx.public_model.clone());
    if let Some(obj) = event.as_object_mut() {
        obj.remove("system_fingerprint");
    }

    if let Some(delta) = event.pointer("/choices/0/delta") {
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            tracker.track_content(content);
        }
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
            tracker.track_content(reasoning);
        }
        if let Some(tool_calls) = delta.get("tool_calls").filter(|t| !t.is_null()) {
            if let Ok(s) = serde_json::to_string(tool_calls) {
                tracker.track_content(&s);
            }
        }
    }

    if let Some(raw_usage) = event.get("usage").filter(|u| !u.is_null()).cloned() {
        if let Some(normalized) = usage_service::normalize_usage(&raw_usage) {
            tracker.record_actual_usage(normalized);
            if let Ok(v) = serde_json::to_value(normalized) {
                event["usage"] = v;
            }
        }
    }

    transformer
        .apply(event)
        .into_iter()
        .map(|e| format!("data: {e}\n\n"))
        .collect()
}

// ── Helpers ───────────────────────────────────────────────────────────

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `chatcmpl-` plus 32 base36 characters, mirrored into every downstream
/// event and the settlement record for this request.
fn generate_request_id() -> String {
    let mut suffix = String::with_capacity(32);
    for byte in Uuid::new_v4()
        .into_bytes()
        .into_iter()
        .chain(Uuid::new_v4().into_bytes())
    {
        suffix.push(BASE36[(byte % 36) as usize] as char);
    }
    format!("chatcmpl-{suffix}")
}

/// Build the chat router (nested under /v1).
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestCtx {
        RequestCtx {
            request_id: "chatcmpl-test0000000000000000000000000".to_string(),
            provider_name: "deepseek".to_string(),
            public_model: "deepseek/deepseek-chat".to_string(),
            chat_history: Vec::new(),
            user_id: Some(1),
            purpose: Purpose::Default,
        }
    }

    #[test]
    fn request_id_shape() {
        let id = generate_request_id();
        let suffix = id.strip_prefix("chatcmpl-").unwrap();
        assert_eq!(suffix.len(), 32);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }

    #[test]
    fn done_sentinel_passes_through() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Identity.transformer();
        let frames = process_line("data: [DONE]", &ctx, &mut tracker, &mut transformer);
        assert_eq!(frames, vec!["data: [DONE]\n\n"]);
    }

    #[test]
    fn unparseable_payload_is_forwarded_verbatim() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Identity.transformer();
        let frames = process_line("data: {not json", &ctx, &mut tracker, &mut transformer);
        assert_eq!(frames, vec!["data: {not json\n\n"]);
    }

    #[test]
    fn event_gets_public_id_and_model_and_loses_fingerprint() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Identity.transformer();

        let line = r#"data: {"id":"up-1","model":"deepseek-chat","system_fingerprint":"fp","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let frames = process_line(line, &ctx, &mut tracker, &mut transformer);
        assert_eq!(frames.len(), 1);

        let event: Value =
            serde_json::from_str(frames[0].strip_prefix("data: ").unwrap().trim()).unwrap();
        assert_eq!(event["id"], ctx.request_id.as_str());
        assert_eq!(event["model"], "deepseek/deepseek-chat");
        assert!(event.get("system_fingerprint").is_none());
    }

    #[test]
    fn tracker_counts_all_delta_kinds() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Identity.transformer();

        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"abcd","reasoning_content":"ef","tool_calls":[{"id":"t"}]},"finish_reason":null}]}"#;
        process_line(line, &ctx, &mut tracker, &mut transformer);

        // 4 + 2 + len("[{\"id\":\"t\"}]") = 4 + 2 + 12
        let usage = tracker.build_usage(0, 0);
        assert_eq!(usage.completion_tokens, 9); // ceil(18 / 2)
    }

    #[test]
    fn usage_tick_is_latched_and_rewritten() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Identity.transformer();

        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"prompt_cache_hit_tokens":2}}"#;
        let frames = process_line(line, &ctx, &mut tracker, &mut transformer);

        assert!(tracker.has_received_usage());
        let event: Value =
            serde_json::from_str(frames[0].strip_prefix("data: ").unwrap().trim()).unwrap();
        assert_eq!(event["usage"]["total_tokens"], 15);
        assert_eq!(event["usage"]["cached_tokens"], 2);
        let usage = tracker.build_usage(0, 0);
        assert_eq!(usage.prompt_tokens, 10);
    }

    #[test]
    fn cursor_stream_rewrite_end_to_end_ordering() {
        let ctx = ctx();
        let mut tracker = StreamTracker::new();
        let mut transformer = Pipeline::Cursor.transformer();

        let upstream = [
            r#"data: {"id":"u","choices":[{"index":0,"delta":{"reasoning_content":"A"},"finish_reason":null}]}"#,
            r#"data: {"id":"u","choices":[{"index":0,"delta":{"reasoning_content":"B"},"finish_reason":null}]}"#,
            r#"data: {"id":"u","choices":[{"index":0,"delta":{"content":"X"},"finish_reason":null}]}"#,
            r#"data: {"id":"u","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ];

        let mut contents = Vec::new();
        let mut frames = Vec::new();
        for line in upstream {
            for frame in process_line(line, &ctx, &mut tracker, &mut transformer) {
                if let Some(payload) = frame.strip_prefix("data: ") {
                    if let Ok(event) = serde_json::from_str::<Value>(payload.trim()) {
                        if let Some(c) =
                            event.pointer("/choices/0/delta/content").and_then(|c| c.as_str())
                        {
                            contents.push(c.to_string());
                        }
                    }
                }
                frames.push(frame);
            }
        }

        assert_eq!(contents, vec!["<think>\n", "A", "B", "\n</think>", "X"]);
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }
}
