//! Request/response shape translation between the Anthropic and
//! OpenAI-compatible wire formats.
//!
//! The common case is passthrough: the request leaves in the shape it arrived
//! in, with only the model field rewritten. Cross-family routing (a downgrade
//! or cascade step landing on the other family) rebuilds the body from the
//! normalized envelope instead.

use serde_json::{json, Map, Value};

use crate::envelope::{Envelope, IngressShape, Role};
use crate::providers::WireShape;

/// Build the outbound body for `model` on a provider speaking `wire`.
pub fn body_for(env: &Envelope, wire: WireShape, model: &str) -> Value {
    let same_shape = matches!(
        (env.ingress, wire),
        (IngressShape::AnthropicMessages, WireShape::Anthropic)
            | (IngressShape::OpenAiChat, WireShape::OpenAiCompatible)
    );

    if same_shape {
        // Passthrough: keep every field the client sent, rewrite what we own.
        let mut body = env.raw.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(model.to_string()));
            obj.insert("stream".into(), Value::Bool(env.stream));
        }
        return body;
    }

    match wire {
        WireShape::Anthropic => to_anthropic(env, model),
        WireShape::OpenAiCompatible => to_openai(env, model),
    }
}

fn to_anthropic(env: &Envelope, model: &str) -> Value {
    let messages: Vec<Value> = env
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();

    let mut obj = Map::new();
    obj.insert("model".into(), Value::String(model.to_string()));
    obj.insert("messages".into(), Value::Array(messages));
    // Anthropic requires max_tokens; fall back to a sane ceiling.
    obj.insert("max_tokens".into(), json!(env.max_tokens.unwrap_or(4096)));
    if let Some(ref system) = env.system {
        obj.insert("system".into(), Value::String(system.clone()));
    }
    if let Some(t) = env.temperature {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(p) = env.top_p {
        obj.insert("top_p".into(), json!(p));
    }
    if let Some(k) = env.top_k {
        obj.insert("top_k".into(), json!(k));
    }
    if let Some(ref stops) = env.stop_sequences {
        obj.insert("stop_sequences".into(), json!(stops));
    }
    if let Some(ref tools) = env.tools {
        obj.insert("tools".into(), Value::Array(tools.clone()));
    }
    if env.stream {
        obj.insert("stream".into(), Value::Bool(true));
    }
    Value::Object(obj)
}

fn to_openai(env: &Envelope, model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(env.messages.len() + 1);
    if let Some(ref system) = env.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for m in &env.messages {
        messages.push(json!({"role": m.role.as_str(), "content": m.content}));
    }

    let mut obj = Map::new();
    obj.insert("model".into(), Value::String(model.to_string()));
    obj.insert("messages".into(), Value::Array(messages));
    if let Some(max) = env.max_tokens {
        obj.insert("max_tokens".into(), json!(max));
    }
    if let Some(t) = env.temperature {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(p) = env.top_p {
        obj.insert("top_p".into(), json!(p));
    }
    if let Some(ref stops) = env.stop_sequences {
        obj.insert("stop".into(), json!(stops));
    }
    if let Some(ref tools) = env.tools {
        obj.insert("tools".into(), Value::Array(tools.clone()));
    }
    if env.stream {
        obj.insert("stream".into(), Value::Bool(true));
    }
    Value::Object(obj)
}

// ---------------------------------------------------------------------------
// Response extraction
// ---------------------------------------------------------------------------

/// Token usage pulled from a provider response body, either shape.
pub fn extract_usage(body: &Value) -> (u64, u64) {
    let usage = &body["usage"];
    // Anthropic: input_tokens/output_tokens; OpenAI: prompt_tokens/completion_tokens.
    let tokens_in = usage["input_tokens"]
        .as_u64()
        .or_else(|| usage["prompt_tokens"].as_u64())
        .unwrap_or(0);
    let tokens_out = usage["output_tokens"]
        .as_u64()
        .or_else(|| usage["completion_tokens"].as_u64())
        .unwrap_or(0);
    (tokens_in, tokens_out)
}

/// Assistant text from a provider response body, either shape. Used for
/// cascade trigger detection.
pub fn extract_text(body: &Value) -> String {
    // Anthropic: content is an array of blocks.
    if let Some(blocks) = body["content"].as_array() {
        return blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join(" ");
    }
    // OpenAI: choices[0].message.content.
    body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string()
}

/// Whether a response body contains tool calls (either shape). Callers that
/// prefer not to cache tool-call responses can consult this.
pub fn response_has_tool_calls(body: &Value) -> bool {
    if let Some(blocks) = body["content"].as_array() {
        if blocks.iter().any(|b| b["type"] == "tool_use") {
            return true;
        }
    }
    if let Some(choices) = body["choices"].as_array() {
        if choices
            .iter()
            .any(|c| !c["message"]["tool_calls"].is_null())
        {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn anthropic_env() -> Envelope {
        Envelope::parse(
            IngressShape::AnthropicMessages,
            json!({
                "model": "claude-sonnet-4-6",
                "system": "be terse",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 128,
                "temperature": 0.0,
                "metadata": {"user_id": "u-1"}
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_passthrough_preserves_unknown_fields() {
        let env = anthropic_env();
        let body = body_for(&env, WireShape::Anthropic, "claude-sonnet-4-6");
        assert_eq!(body["metadata"]["user_id"], "u-1");
        assert_eq!(body["model"], "claude-sonnet-4-6");
    }

    #[test]
    fn test_passthrough_rewrites_model() {
        let env = anthropic_env();
        let body = body_for(&env, WireShape::Anthropic, "claude-haiku-4-5");
        assert_eq!(body["model"], "claude-haiku-4-5");
        // Everything else survives.
        assert_eq!(body["max_tokens"], 128);
    }

    #[test]
    fn test_cross_family_anthropic_to_openai() {
        let env = anthropic_env();
        let body = body_for(&env, WireShape::OpenAiCompatible, "gpt-4o-mini");
        assert_eq!(body["model"], "gpt-4o-mini");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn test_cross_family_openai_to_anthropic() {
        let env = Envelope::parse(
            IngressShape::OpenAiChat,
            json!({
                "model": "gpt-4o",
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "hi"}
                ]
            }),
        )
        .unwrap();
        let body = body_for(&env, WireShape::Anthropic, "claude-sonnet-4-6");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        // Anthropic requires max_tokens even when the client sent none.
        assert!(body["max_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_extract_usage_anthropic() {
        let body = json!({"usage": {"input_tokens": 120, "output_tokens": 30}});
        assert_eq!(extract_usage(&body), (120, 30));
    }

    #[test]
    fn test_extract_usage_openai() {
        let body = json!({"usage": {"prompt_tokens": 80, "completion_tokens": 10}});
        assert_eq!(extract_usage(&body), (80, 10));
    }

    #[test]
    fn test_extract_usage_missing() {
        assert_eq!(extract_usage(&json!({})), (0, 0));
    }

    #[test]
    fn test_extract_text_anthropic() {
        let body = json!({"content": [{"type": "text", "text": "hello"}, {"type": "text", "text": "world"}]});
        assert_eq!(extract_text(&body), "hello world");
    }

    #[test]
    fn test_extract_text_openai() {
        let body = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_text(&body), "hello");
    }

    #[test]
    fn test_response_has_tool_calls() {
        let anthropic = json!({"content": [{"type": "tool_use", "name": "get_weather"}]});
        assert!(response_has_tool_calls(&anthropic));

        let openai = json!({"choices": [{"message": {"tool_calls": [{"id": "c1"}]}}]});
        assert!(response_has_tool_calls(&openai));

        let plain = json!({"content": [{"type": "text", "text": "hi"}]});
        assert!(!response_has_tool_calls(&plain));
    }
}
