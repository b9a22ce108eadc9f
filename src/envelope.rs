//! Normalized request envelope.
//!
//! Both ingress shapes (Anthropic `/v1/messages`, OpenAI
//! `/v1/chat/completions`) are parsed into one structure the pipeline works
//! over. The original JSON body is preserved so passthrough fields the proxy
//! does not interpret survive the round trip.

use std::sync::{LazyLock, Mutex};

use serde::Serialize;
use serde_json::Value;
use uuid::{ContextV7, Timestamp, Uuid};

use crate::error::AppError;
use crate::providers::Provider;

/// Process-wide counter context for request ids. A bare `Uuid::now_v7()`
/// only orders by its millisecond timestamp; the shared context adds the
/// RFC 9562 counter so ids minted within the same millisecond still sort
/// in creation order.
static REQUEST_ID_CONTEXT: LazyLock<Mutex<ContextV7>> =
    LazyLock::new(|| Mutex::new(ContextV7::new()));

fn next_request_id() -> Uuid {
    Uuid::new_v7(Timestamp::now(&*REQUEST_ID_CONTEXT))
}

/// Which wire shape the request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressShape {
    AnthropicMessages,
    OpenAiChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "system" | "developer" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A message with its content flattened to plain text. Multimodal parts other
/// than text are dropped from the normalized view (the raw body still carries
/// them to the provider).
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The normalized in-memory representation of a chat request.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: Uuid,
    pub model: String,
    pub original_model: String,
    pub ingress: IngressShape,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: bool,
    pub raw: Value,
}

impl Envelope {
    /// Parse an ingress body. Malformed bodies produce a 400.
    pub fn parse(ingress: IngressShape, body: Value) -> Result<Self, AppError> {
        match ingress {
            IngressShape::AnthropicMessages => Self::from_anthropic(body),
            IngressShape::OpenAiChat => Self::from_openai(body),
        }
    }

    fn from_anthropic(body: Value) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| AppError::BadRequest("request body must be a JSON object".into()))?;

        let model = required_string(obj, "model")?;
        let raw_messages = obj
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::BadRequest("missing or invalid `messages`".into()))?;

        let mut messages = Vec::with_capacity(raw_messages.len());
        for msg in raw_messages {
            messages.push(parse_message(msg)?);
        }
        if messages.is_empty() {
            return Err(AppError::BadRequest("`messages` must not be empty".into()));
        }

        // Anthropic carries the system prompt as a top-level field, either a
        // string or an array of text blocks.
        let system = obj.get("system").map(flatten_content).filter(|s| !s.is_empty());

        let stop_sequences = obj
            .get("stop_sequences")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });

        Ok(Self {
            request_id: next_request_id(),
            original_model: model.clone(),
            model,
            ingress: IngressShape::AnthropicMessages,
            messages,
            system,
            tools: obj.get("tools").and_then(Value::as_array).cloned(),
            tool_choice: obj.get("tool_choice").cloned(),
            temperature: obj.get("temperature").and_then(Value::as_f64),
            max_tokens: obj.get("max_tokens").and_then(Value::as_u64),
            top_p: obj.get("top_p").and_then(Value::as_f64),
            top_k: obj.get("top_k").and_then(Value::as_u64),
            stop_sequences,
            stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
            raw: body,
        })
    }

    fn from_openai(body: Value) -> Result<Self, AppError> {
        let obj = body
            .as_object()
            .ok_or_else(|| AppError::BadRequest("request body must be a JSON object".into()))?;

        let model = required_string(obj, "model")?;
        let raw_messages = obj
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| AppError::BadRequest("missing or invalid `messages`".into()))?;

        // OpenAI puts the system prompt in the message list; lift it out so
        // both shapes normalize identically.
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages = Vec::with_capacity(raw_messages.len());
        for msg in raw_messages {
            let parsed = parse_message(msg)?;
            if parsed.role == Role::System {
                system_parts.push(parsed.content);
            } else {
                messages.push(parsed);
            }
        }
        if messages.is_empty() && system_parts.is_empty() {
            return Err(AppError::BadRequest("`messages` must not be empty".into()));
        }

        // OpenAI `stop` may be a single string or an array.
        let stop_sequences = match obj.get("stop") {
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(Value::Array(a)) => Some(
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        };

        let max_tokens = obj
            .get("max_tokens")
            .or_else(|| obj.get("max_completion_tokens"))
            .and_then(Value::as_u64);

        Ok(Self {
            request_id: next_request_id(),
            original_model: model.clone(),
            model,
            ingress: IngressShape::OpenAiChat,
            messages,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
            tools: obj.get("tools").and_then(Value::as_array).cloned(),
            tool_choice: obj.get("tool_choice").cloned(),
            temperature: obj.get("temperature").and_then(Value::as_f64),
            max_tokens,
            top_p: obj.get("top_p").and_then(Value::as_f64),
            top_k: obj.get("top_k").and_then(Value::as_u64),
            stop_sequences,
            stream: obj.get("stream").and_then(Value::as_bool).unwrap_or(false),
            raw: body,
        })
    }

    /// Provider family derived from the (possibly rewritten) model name.
    pub fn provider(&self) -> Option<Provider> {
        Provider::from_model(&self.model)
    }

    /// Content of the last user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Rough input token estimate (4 chars per token) over system prompt and
    /// messages. Used for budget estimates and complexity scoring only.
    pub fn approx_input_tokens(&self) -> u64 {
        let chars: usize = self.system.as_deref().map_or(0, str::len)
            + self.messages.iter().map(|m| m.content.len()).sum::<usize>();
        (chars / 4) as u64
    }
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, AppError> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("missing or invalid `{key}`")))
}

fn parse_message(msg: &Value) -> Result<ChatMessage, AppError> {
    let obj = msg
        .as_object()
        .ok_or_else(|| AppError::BadRequest("each message must be an object".into()))?;
    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or_else(|| AppError::BadRequest("message has missing or unknown `role`".into()))?;
    let content = obj.get("content").map(flatten_content).unwrap_or_default();
    Ok(ChatMessage { role, content })
}

/// Flatten message content (a plain string or an array of typed blocks) into
/// plain text. Non-text blocks contribute nothing.
pub fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
