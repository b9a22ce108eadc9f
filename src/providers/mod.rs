//! Upstream Provider Module
//!
//! Defines the provider registry (which family serves which model, which env
//! var carries its key), the `Upstream` trait used by the pipeline to forward
//! requests, and the error type for everything past the egress boundary.

pub mod http;
pub mod pricing;
pub mod translate;

use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::OutboundAuth;

pub use self::http::HttpUpstream;
pub use self::pricing::PricingTable;

// ---------------------------------------------------------------------------
// Provider registry
// ---------------------------------------------------------------------------

/// An upstream provider family. Anthropic speaks its own messages API; every
/// other family here is OpenAI-compatible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    XAi,
    OpenRouter,
    DeepSeek,
    Groq,
    Moonshot,
}

/// Wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// Anthropic `/v1/messages`.
    Anthropic,
    /// OpenAI `/v1/chat/completions` and compatibles.
    OpenAiCompatible,
}

impl Provider {
    /// Resolve the provider family from a model name.
    ///
    /// Mapping rules:
    ///   claude-*                -> anthropic
    ///   gpt-* | o1* | o3* | o4* -> openai
    ///   gemini-*                -> gemini
    ///   grok-*                  -> xai
    ///   openrouter/*            -> openrouter
    ///   deepseek-*              -> deepseek
    ///   llama-* | groq/*        -> groq
    ///   kimi-* | moonshot-*     -> moonshot
    pub fn from_model(model: &str) -> Option<Self> {
        if model.starts_with("claude-") {
            return Some(Self::Anthropic);
        }
        if model.starts_with("gpt-")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
        {
            return Some(Self::OpenAi);
        }
        if model.starts_with("gemini-") {
            return Some(Self::Gemini);
        }
        if model.starts_with("grok-") {
            return Some(Self::XAi);
        }
        if model.starts_with("openrouter/") {
            return Some(Self::OpenRouter);
        }
        if model.starts_with("deepseek-") {
            return Some(Self::DeepSeek);
        }
        if model.starts_with("llama-") || model.starts_with("groq/") {
            return Some(Self::Groq);
        }
        if model.starts_with("kimi-") || model.starts_with("moonshot-") {
            return Some(Self::Moonshot);
        }
        None
    }

    /// Stable identifier used for cooldown tracking and logging.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::XAi => "xai",
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Moonshot => "moonshot",
        }
    }

    /// Environment variable carrying this provider's API key.
    pub fn env_key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::XAi => "XAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::Groq => "GROQ_API_KEY",
            Self::Moonshot => "MOONSHOT_API_KEY",
        }
    }

    /// Default API base URL.
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::XAi => "https://api.x.ai",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Groq => "https://api.groq.com/openai",
            Self::Moonshot => "https://api.moonshot.ai",
        }
    }

    pub fn wire(&self) -> WireShape {
        match self {
            Self::Anthropic => WireShape::Anthropic,
            _ => WireShape::OpenAiCompatible,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Whether the proxy will route this model: it must be in the registry.
/// Prefix matching alone would happily forward typos like
/// `claude-sonet-4-6`; those get a 400 with suggestions instead.
pub fn is_known_model(model: &str) -> bool {
    known_models().contains(&model)
}

/// Models the proxy knows about: routing aliases resolve into this set, and
/// near-misses against it drive the 400 `suggestions` body.
pub fn known_models() -> Vec<&'static str> {
    vec![
        "claude-opus-4-6",
        "claude-opus-4-1",
        "claude-sonnet-4-6",
        "claude-sonnet-4-5",
        "claude-haiku-4-5",
        "gpt-5.2",
        "gpt-5-mini",
        "gpt-4o",
        "gpt-4o-mini",
        "o3",
        "o3-mini",
        "gemini-2.5-pro",
        "gemini-2.5-flash",
        "grok-4",
        "deepseek-v3",
        "llama-3.3-70b",
        "kimi-k2",
    ]
}

// ---------------------------------------------------------------------------
// Upstream trait
// ---------------------------------------------------------------------------

/// A fully prepared outbound request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub provider: Provider,
    pub model: String,
    pub body: serde_json::Value,
    pub auth: OutboundAuth,
    pub timeout: Duration,
    pub stream: bool,
}

/// Raw response from a provider. Non-2xx statuses are carried here too so the
/// pipeline can mirror them; only transport-level failures become errors.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Chunked response body for streaming relay.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

/// Response head plus a live body stream (SSE relay).
pub struct UpstreamStreamResponse {
    pub status: u16,
    pub content_type: String,
    pub stream: ByteStream,
}

/// The egress seam. The pipeline only ever talks to providers through this
/// trait; tests substitute a stub that records calls.
pub trait Upstream: Send + Sync {
    fn forward(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<UpstreamResponse, ProviderError>> + Send + '_>>;

    /// Forward a streaming request, handing back the provider's byte stream
    /// for relay. Dropping the stream aborts the upstream call.
    fn forward_stream(
        &self,
        request: UpstreamRequest,
    ) -> Pin<
        Box<
            dyn std::future::Future<Output = Result<UpstreamStreamResponse, ProviderError>>
                + Send
                + '_,
        >,
    >;
}

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors past the egress boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("API error ({status})")]
    Api { status: u16, body: Vec<u8> },

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

impl ProviderError {
    /// Whether this failure should count against the provider's cooldown
    /// window. Client-shaped errors (4xx) do not.
    pub fn is_provider_fault(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::ResponseParsing(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_secs: 0 }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
