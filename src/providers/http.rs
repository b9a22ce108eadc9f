//! HTTP egress to upstream providers.
//!
//! One reqwest client shared across all families; the per-request timeout
//! comes from the pipeline so config changes apply without a rebuild.

use std::collections::HashMap;
use std::pin::Pin;

use futures::StreamExt;
use reqwest::Client;

use crate::auth::OutboundAuth;
use crate::providers::{
    Provider, ProviderError, Upstream, UpstreamRequest, UpstreamResponse,
    UpstreamStreamResponse, WireShape,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpUpstream {
    client: Client,
    /// Per-provider base URL overrides (testing against local fakes).
    base_overrides: HashMap<Provider, String>,
}

impl HttpUpstream {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_overrides: HashMap::new(),
        }
    }

    /// Override the base URL for one provider.
    pub fn with_base_url(mut self, provider: Provider, base: impl Into<String>) -> Self {
        self.base_overrides.insert(provider, base.into());
        self
    }

    fn url_for(&self, provider: Provider) -> String {
        let base = self
            .base_overrides
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.base_url());
        match provider.wire() {
            WireShape::Anthropic => format!("{base}/v1/messages"),
            WireShape::OpenAiCompatible => format!("{base}/v1/chat/completions"),
        }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for HttpUpstream {
    fn forward(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<UpstreamResponse, ProviderError>> + Send + '_>>
    {
        let url = self.url_for(request.provider);
        let client = self.client.clone();

        Box::pin(async move {
            let timeout_secs = request.timeout.as_secs();
            let mut builder = client.post(&url).timeout(request.timeout);

            builder = match (&request.auth, request.provider.wire()) {
                (OutboundAuth::ApiKey(key), WireShape::Anthropic) => {
                    builder.header("x-api-key", key)
                }
                (OutboundAuth::Bearer(token), _) => builder.bearer_auth(token),
                (OutboundAuth::ApiKey(key), WireShape::OpenAiCompatible) => {
                    builder.bearer_auth(key)
                }
            };
            if request.provider.wire() == WireShape::Anthropic {
                builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
            }

            let response = builder.json(&request.body).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { timeout_secs }
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { timeout_secs }
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

            Ok(UpstreamResponse {
                status,
                body: body.to_vec(),
            })
        })
    }

    fn forward_stream(
        &self,
        request: UpstreamRequest,
    ) -> Pin<
        Box<
            dyn std::future::Future<Output = Result<UpstreamStreamResponse, ProviderError>>
                + Send
                + '_,
        >,
    > {
        let url = self.url_for(request.provider);
        let client = self.client.clone();

        Box::pin(async move {
            let timeout_secs = request.timeout.as_secs();
            let mut builder = client.post(&url).timeout(request.timeout);

            builder = match (&request.auth, request.provider.wire()) {
                (OutboundAuth::ApiKey(key), WireShape::Anthropic) => {
                    builder.header("x-api-key", key)
                }
                (OutboundAuth::Bearer(token), _) => builder.bearer_auth(token),
                (OutboundAuth::ApiKey(key), WireShape::OpenAiCompatible) => {
                    builder.bearer_auth(key)
                }
            };
            if request.provider.wire() == WireShape::Anthropic {
                builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
            }

            let response = builder.json(&request.body).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout { timeout_secs }
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/event-stream")
                .to_string();

            let stream = response
                .bytes_stream()
                .map(|chunk| match chunk {
                    Ok(bytes) => Ok(bytes.to_vec()),
                    Err(e) => Err(ProviderError::Transport(e.to_string())),
                });

            Ok(UpstreamStreamResponse {
                status,
                content_type,
                stream: Box::pin(stream),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
