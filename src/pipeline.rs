use serde_json::{json, Value};

use crate::models::api_key::Purpose;

const THINK_OPEN: &str = "<think>\n";
const THINK_CLOSE: &str = "\n</think>";

/// Purpose-selected transformation set applied at request entry, non-stream
/// exit, and per SSE event.
///
/// The cursor variant serves clients that only read standard `content`:
/// reasoning is carried as a `<think>` block inside `content` on the way
/// out, and peeled back into `reasoning_content` on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Identity,
    Cursor,
}

impl Pipeline {
    pub fn for_purpose(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Default => Pipeline::Identity,
            Purpose::Cursor => Pipeline::Cursor,
        }
    }

    /// Request preprocess before upstream dispatch.
    pub fn preprocess(&self, payload: Value) -> Value {
        match self {
            Pipeline::Identity => payload,
            Pipeline::Cursor => cursor_preprocess(payload),
        }
    }

    /// Non-stream response postprocess.
    pub fn postprocess(&self, response: Value) -> Value {
        match self {
            Pipeline::Identity => response,
            Pipeline::Cursor => cursor_postprocess(response),
        }
    }

    /// Fresh per-stream event transformer.
    pub fn transformer(&self) -> StreamTransform {
        StreamTransform {
            rewrite: matches!(self, Pipeline::Cursor),
            reasoning: false,
        }
    }
}

/// Peel `<think>…</think>` blocks out of assistant part-list content and
/// reassign them to `reasoning_content`, so the upstream sees the same
/// separation it originally emitted.
fn cursor_preprocess(mut payload: Value) -> Value {
    let Some(messages) = payload.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return payload;
    };

    for message in messages {
        if message.get("role").and_then(|r| r.as_str()) != Some("assistant") {
            continue;
        }
        let Some(parts) = message.get("content").and_then(|c| c.as_array()) else {
            continue;
        };
        let Some(text) = parts
            .iter()
            .find(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
        else {
            continue;
        };
        let Some((think, remainder)) = split_think(text) else {
            continue;
        };

        message["reasoning_content"] = Value::String(think);
        message["content"] = if remainder.is_empty() {
            json!([])
        } else {
            json!([{ "type": "text", "text": remainder }])
        };
    }

    payload
}

fn split_think(text: &str) -> Option<(String, String)> {
    let start = text.find(THINK_OPEN)?;
    let after_open = &text[start + THINK_OPEN.len()..];
    let end = after_open.find(THINK_CLOSE)?;

    let think = after_open[..end].to_string();
    let remainder = format!(
        "{}{}",
        &text[..start],
        &after_open[end + THINK_CLOSE.len()..]
    );
    Some((think, remainder))
}

/// Fold `reasoning_content` back into `content` as a `<think>` block.
fn cursor_postprocess(mut response: Value) -> Value {
    let Some(message) = response.pointer_mut("/choices/0/message") else {
        return response;
    };

    let reasoning = match message.get("reasoning_content").and_then(|r| r.as_str()) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => return response,
    };
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    message["content"] = Value::String(format!("<think>{reasoning}</think>{content}"));
    if let Some(obj) = message.as_object_mut() {
        obj.remove("reasoning_content");
    }

    response
}

/// Stateful per-event rewriter for the stream path. One upstream event maps
/// to zero or more downstream events; marker events opening and closing the
/// `<think>` block are synthesized at the reasoning boundary.
#[derive(Debug)]
pub struct StreamTransform {
    rewrite: bool,
    reasoning: bool,
}

impl StreamTransform {
    /// Transform one upstream event into its downstream events, in order.
    pub fn apply(&mut self, event: Value) -> Vec<Value> {
        if !self.rewrite {
            return vec![event];
        }

        let reasoning_chunk = event
            .pointer("/choices/0/delta/reasoning_content")
            .and_then(|r| r.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        match (reasoning_chunk, self.reasoning) {
            (Some(chunk), false) => {
                self.reasoning = true;
                vec![derive_content(&event, THINK_OPEN), derive_content(&event, &chunk)]
            }
            (Some(chunk), true) => vec![derive_content(&event, &chunk)],
            (None, true) => {
                self.reasoning = false;
                vec![derive_content(&event, THINK_CLOSE), event]
            }
            (None, false) => vec![event],
        }
    }
}

/// Copy of the base event whose delta carries only plain content. Derived
/// events never carry a finish reason.
fn derive_content(base: &Value, content: &str) -> Value {
    let mut event = base.clone();
    if let Some(choice) = event.pointer_mut("/choices/0") {
        choice["delta"] = json!({ "content": content });
        choice["finish_reason"] = Value::Null;
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(delta: Value, finish_reason: Value) -> Value {
        json!({
            "id": "u-1",
            "object": "chat.completion.chunk",
            "model": "deepseek-reasoner",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }

    fn contents(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.pointer("/choices/0/delta/content"))
            .filter_map(|c| c.as_str())
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn identity_pipeline_passes_events_through() {
        let mut transform = Pipeline::Identity.transformer();
        let event = chunk(json!({"reasoning_content": "R"}), Value::Null);
        assert_eq!(transform.apply(event.clone()), vec![event]);
    }

    #[test]
    fn cursor_stream_wraps_reasoning_in_think_markers() {
        let mut transform = Pipeline::Cursor.transformer();
        let mut emitted = Vec::new();

        emitted.extend(transform.apply(chunk(json!({"reasoning_content": "A"}), Value::Null)));
        emitted.extend(transform.apply(chunk(json!({"reasoning_content": "B"}), Value::Null)));
        emitted.extend(transform.apply(chunk(json!({"content": "X"}), Value::Null)));
        emitted.extend(transform.apply(chunk(json!({}), json!("stop"))));

        assert_eq!(
            contents(&emitted),
            vec!["<think>\n", "A", "B", "\n</think>", "X"]
        );
        // concatenation law
        assert_eq!(contents(&emitted).concat(), "<think>\nAB\n</think>X");
        // the final upstream event passes through unchanged
        assert_eq!(
            emitted.last().unwrap()["choices"][0]["finish_reason"],
            json!("stop")
        );
    }

    #[test]
    fn synthesized_marker_events_carry_null_finish_reason() {
        let mut transform = Pipeline::Cursor.transformer();
        let out = transform.apply(chunk(json!({"reasoning_content": "A"}), json!("length")));
        assert_eq!(out.len(), 2);
        for event in &out {
            assert_eq!(event["choices"][0]["finish_reason"], Value::Null);
        }
    }

    #[test]
    fn close_marker_precedes_first_content_event() {
        let mut transform = Pipeline::Cursor.transformer();
        transform.apply(chunk(json!({"reasoning_content": "R"}), Value::Null));
        let out = transform.apply(chunk(json!({"content": "X"}), Value::Null));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["choices"][0]["delta"]["content"], "\n</think>");
        assert_eq!(out[1]["choices"][0]["delta"]["content"], "X");
    }

    #[test]
    fn content_only_stream_is_untouched() {
        let mut transform = Pipeline::Cursor.transformer();
        let event = chunk(json!({"content": "plain"}), Value::Null);
        assert_eq!(transform.apply(event.clone()), vec![event]);
    }

    #[test]
    fn preprocess_splits_think_block_into_reasoning() {
        let payload = json!({
            "messages": [
                {"role": "user", "content": "question"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "<think>\nchain of thought\n</think>the answer"}
                ]},
            ]
        });

        let out = Pipeline::Cursor.preprocess(payload);
        let assistant = &out["messages"][1];
        assert_eq!(assistant["reasoning_content"], "chain of thought");
        assert_eq!(assistant["content"][0]["text"], "the answer");
    }

    #[test]
    fn preprocess_empties_content_when_only_think_block() {
        let payload = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "<think>\nonly reasoning\n</think>"}
                ]},
            ]
        });

        let out = Pipeline::Cursor.preprocess(payload);
        assert_eq!(out["messages"][0]["content"], json!([]));
    }

    #[test]
    fn preprocess_leaves_string_content_and_other_roles_alone() {
        let payload = json!({
            "messages": [
                {"role": "assistant", "content": "<think>\nnot a part list\n</think>x"},
                {"role": "user", "content": [{"type": "text", "text": "<think>\nu\n</think>"}]},
            ]
        });
        assert_eq!(Pipeline::Cursor.preprocess(payload.clone()), payload);
    }

    #[test]
    fn postprocess_folds_reasoning_into_content() {
        let response = json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "the answer",
                "reasoning_content": "why",
            }}]
        });

        let out = Pipeline::Cursor.postprocess(response);
        let message = &out["choices"][0]["message"];
        assert_eq!(message["content"], "<think>why</think>the answer");
        assert!(message.get("reasoning_content").is_none());
    }

    #[test]
    fn postprocess_is_identity_without_reasoning() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "plain"}}]
        });
        assert_eq!(Pipeline::Cursor.postprocess(response.clone()), response);
    }
}
