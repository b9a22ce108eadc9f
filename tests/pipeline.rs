//! End-to-end pipeline tests against a stub upstream.
//!
//! Requests are driven through the real axum router; the only substituted
//! piece is the egress seam, which records every outbound call.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use relayplane::api;
use relayplane::auth::OutboundAuth;
use relayplane::config::{BreachAction, CacheMode, ProxyConfig, RoutingMode};
use relayplane::providers::{
    Provider, ProviderError, Upstream, UpstreamRequest, UpstreamResponse, UpstreamStreamResponse,
};
use relayplane::{AppState, Deps};

// ---------------------------------------------------------------------------
// Stub upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RecordedCall {
    provider: Provider,
    model: String,
    auth: OutboundAuth,
    body: Value,
}

type Responder = dyn Fn(usize, &UpstreamRequest) -> Result<UpstreamResponse, ProviderError>
    + Send
    + Sync;

struct StubUpstream {
    calls: Mutex<Vec<RecordedCall>>,
    counter: AtomicUsize,
    responder: Box<Responder>,
}

impl StubUpstream {
    fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(usize, &UpstreamRequest) -> Result<UpstreamResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            responder: Box::new(responder),
        })
    }

    /// Answers every call with a unique assistant message.
    fn ok() -> Arc<Self> {
        Self::new(|n, request| Ok(anthropic_ok(n, &request.model, "The answer is 4.")))
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn anthropic_ok(n: usize, model: &str, text: &str) -> UpstreamResponse {
    let body = json!({
        "id": format!("msg_{n}"),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "usage": {"input_tokens": 12, "output_tokens": 6}
    });
    UpstreamResponse {
        status: 200,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

impl Upstream for StubUpstream {
    fn forward(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<UpstreamResponse, ProviderError>> + Send + '_>>
    {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            provider: request.provider,
            model: request.model.clone(),
            auth: request.auth.clone(),
            body: request.body.clone(),
        });
        let result = (self.responder)(n, &request);
        Box::pin(async move { result })
    }

    fn forward_stream(
        &self,
        _request: UpstreamRequest,
    ) -> Pin<
        Box<
            dyn std::future::Future<Output = Result<UpstreamStreamResponse, ProviderError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async { Err(ProviderError::Transport("streaming not stubbed".into())) })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn app_with(config: ProxyConfig, upstream: Arc<StubUpstream>) -> (Router, AppState) {
    let (deps, _flusher) = Deps::in_memory(config, upstream);
    let app = api::build_router().with_state(deps.clone());
    (app, deps)
}

async fn post_json(
    app: &Router,
    path: &str,
    body: Value,
    extra_headers: &[(&str, &str)],
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-api-key", "sk-ant-api03-test");
    for (name, value) in extra_headers {
        request = request.header(*name, *value);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, parsed)
}

fn chat_body(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "temperature": 0.0,
        "max_tokens": 128
    })
}

// ---------------------------------------------------------------------------
// Cache scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_mode_second_request_hits_cache() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let body = json!({
        "model": "claude-sonnet-4-6",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.0
    });

    let (status, headers, first) = post_json(&app, "/v1/messages", body.clone(), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-cache"], "miss");

    let (status, headers, second) = post_json(&app, "/v1/messages", body, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-cache"], "hit");
    assert_eq!(headers["x-relayplane-routed-model"], "claude-sonnet-4-6");

    // Byte-identical response, exactly one provider call.
    assert_eq!(first, second);
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn exact_mode_nonzero_temperature_bypasses() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let body = json!({
        "model": "claude-sonnet-4-6",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.7
    });

    let (_, headers, _) = post_json(&app, "/v1/messages", body.clone(), &[]).await;
    assert_eq!(headers["x-relayplane-cache"], "bypass");
    let (_, headers, _) = post_json(&app, "/v1/messages", body, &[]).await;
    assert_eq!(headers["x-relayplane-cache"], "bypass");
    assert_eq!(upstream.call_count(), 2);
}

#[tokio::test]
async fn aggressive_mode_ignores_history() {
    let upstream = StubUpstream::ok();
    let mut config = ProxyConfig::default();
    config.cache.mode = CacheMode::Aggressive;
    let (app, _deps) = app_with(config, upstream.clone());

    let short = json!({
        "model": "claude-sonnet-4-6",
        "system": "be terse",
        "messages": [{"role": "user", "content": "What is 2+2?"}]
    });
    let long = json!({
        "model": "claude-sonnet-4-6",
        "system": "be terse",
        "messages": [
            {"role": "user", "content": "tell me about rust"},
            {"role": "assistant", "content": "a systems language"},
            {"role": "user", "content": "What is 2+2?"}
        ]
    });

    let (_, _, first) = post_json(&app, "/v1/messages", short, &[]).await;
    let (_, headers, second) = post_json(&app, "/v1/messages", long, &[]).await;

    assert_eq!(headers["x-relayplane-cache"], "hit");
    assert_eq!(first, second);
    assert_eq!(upstream.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Budget scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_block_returns_402_without_upstream_call() {
    let upstream = StubUpstream::ok();
    let mut config = ProxyConfig::default();
    config.budget.enabled = true;
    config.budget.daily_usd = Some(1.0);
    config.budget.on_breach = BreachAction::Block;
    let (app, deps) = app_with(config, upstream.clone());

    deps.budget.record_spend(1.0, "claude-sonnet-4-6");

    let (status, _, body) =
        post_json(&app, "/v1/messages", chat_body("claude-sonnet-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "budget_exceeded");
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn budget_downgrade_rewrites_model_and_sets_headers() {
    let upstream = StubUpstream::ok();
    let mut config = ProxyConfig::default();
    config.budget.enabled = true;
    config.budget.daily_usd = Some(10.0);
    config.downgrade.enabled = true;
    config.downgrade.threshold_percent = 80;
    config
        .downgrade
        .mapping
        .insert("claude-opus-4-6".to_string(), "claude-sonnet-4-6".to_string());
    let (app, deps) = app_with(config, upstream.clone());

    deps.budget.record_spend(8.0, "claude-opus-4-6");

    let (status, headers, _) =
        post_json(&app, "/v1/messages", chat_body("claude-opus-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-routed-model"], "claude-sonnet-4-6");
    assert_eq!(headers["x-relayplane-original-model"], "claude-opus-4-6");
    assert_eq!(headers["x-relayplane-downgraded"], "true");
    assert!(headers.contains_key("x-relayplane-downgrade-reason"));

    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].model, "claude-sonnet-4-6");
}

// ---------------------------------------------------------------------------
// Routing scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn alias_resolves_before_forwarding() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let (status, headers, _) =
        post_json(&app, "/v1/messages", chat_body("rp:balanced", "hi"), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-routed-model"], "claude-sonnet-4-6");
    assert_eq!(headers["x-relayplane-original-model"], "rp:balanced");
    assert_eq!(upstream.calls()[0].model, "claude-sonnet-4-6");
}

#[tokio::test]
async fn unknown_model_gets_suggestions() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let (status, _, body) =
        post_json(&app, "/v1/messages", chat_body("claude-sonet-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let suggestions = body["error"]["suggestions"].as_array().unwrap();
    assert!(suggestions
        .iter()
        .any(|s| s.as_str() == Some("claude-sonnet-4-6")));
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn cascade_escalates_on_uncertain_response() {
    let upstream = StubUpstream::new(|n, request| {
        // The cheap model hedges; the next rung answers confidently.
        if request.model.contains("haiku") {
            Ok(anthropic_ok(n, &request.model, "I'm not sure about that."))
        } else {
            Ok(anthropic_ok(n, &request.model, "The answer is 4."))
        }
    });
    let mut config = ProxyConfig::default();
    config.routing.mode = RoutingMode::Cascade;
    let (app, _deps) = app_with(config, upstream.clone());

    let (status, headers, body) =
        post_json(&app, "/v1/messages", chat_body("claude-haiku-4-5", "hard question"), &[])
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-mode"], "cascade");
    assert_eq!(headers["x-relayplane-escalations"], "1");
    assert_eq!(headers["x-relayplane-routed-model"], "claude-sonnet-4-6");
    assert_eq!(body["content"][0]["text"], "The answer is 4.");

    let calls = upstream.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].model, "claude-haiku-4-5");
    assert_eq!(calls[1].model, "claude-sonnet-4-6");
}

#[tokio::test]
async fn cascade_escalates_on_transport_error() {
    let upstream = StubUpstream::new(|n, request| {
        if request.model.contains("haiku") {
            Err(ProviderError::Transport("connection reset".into()))
        } else {
            Ok(anthropic_ok(n, &request.model, "recovered"))
        }
    });
    let mut config = ProxyConfig::default();
    config.routing.mode = RoutingMode::Cascade;
    let (app, _deps) = app_with(config, upstream.clone());

    let (status, headers, _) =
        post_json(&app, "/v1/messages", chat_body("claude-haiku-4-5", "hi"), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-escalations"], "1");
}

// ---------------------------------------------------------------------------
// Cooldown scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cooled_provider_returns_503() {
    let upstream =
        StubUpstream::new(|_, _| Err(ProviderError::Transport("connection refused".into())));
    let mut config = ProxyConfig::default();
    config.cooldown.allowed_fails = 1;
    let (app, _deps) = app_with(config, upstream.clone());

    // First request fails upstream and trips the quarantine.
    let (status, _, _) =
        post_json(&app, "/v1/messages", chat_body("claude-sonnet-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // Second request never reaches the provider.
    let (status, _, body) =
        post_json(&app, "/v1/messages", chat_body("claude-sonnet-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "provider_cooldown");
    assert_eq!(upstream.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Bypass and error shapes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bypass_header_skips_all_pipeline_logic() {
    let upstream = StubUpstream::ok();
    let (app, deps) = app_with(ProxyConfig::default(), upstream.clone());

    let body = chat_body("claude-sonnet-4-6", "hi");
    let bypass = [("x-relayplane-bypass", "true")];
    let (status, headers, _) = post_json(&app, "/v1/messages", body.clone(), &bypass).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!headers.contains_key("x-relayplane-cache"));

    // Identical deterministic request forwarded again: nothing was cached.
    post_json(&app, "/v1/messages", body, &bypass).await;
    assert_eq!(upstream.call_count(), 2);
    assert_eq!(deps.runs.stats().total_requests, 0);
}

#[tokio::test]
async fn upstream_4xx_is_mirrored() {
    let upstream = StubUpstream::new(|_, _| {
        Ok(UpstreamResponse {
            status: 429,
            body: br#"{"error":{"type":"rate_limit_error"}}"#.to_vec(),
        })
    });
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let (status, _, body) =
        post_json(&app, "/v1/messages", chat_body("claude-sonnet-4-6", "hi"), &[]).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let (status, _, _) = post_json(&app, "/v1/messages", json!({"messages": []}), &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(upstream.call_count(), 0);
}

// ---------------------------------------------------------------------------
// OpenAI-shape ingress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn openai_ingress_forwards_and_caches() {
    let upstream = StubUpstream::new(|n, request| {
        let body = json!({
            "id": format!("chatcmpl-{n}"),
            "object": "chat.completion",
            "model": request.model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        Ok(UpstreamResponse { status: 200, body: serde_json::to_vec(&body).unwrap() })
    });
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let body = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0
    });
    let (status, headers, _) = post_json(&app, "/v1/chat/completions", body.clone(), &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-relayplane-cache"], "miss");
    assert_eq!(upstream.calls()[0].provider, Provider::OpenAi);

    let (_, headers, _) = post_json(&app, "/v1/chat/completions", body, &[]).await;
    assert_eq!(headers["x-relayplane-cache"], "hit");
    assert_eq!(upstream.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Auth contract through the pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn oauth_token_passes_through_to_oauth_capable_model() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("x-api-key", "sk-ant-REDACTED")
        .body(Body::from(chat_body("claude-sonnet-4-6", "hi").to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    match &upstream.calls()[0].auth {
        OutboundAuth::Bearer(token) => assert_eq!(token, "sk-ant-REDACTED"),
        other => panic!("expected bearer passthrough, got {other:?}"),
    }
}

#[tokio::test]
async fn telemetry_endpoints_report_runs() {
    let upstream = StubUpstream::ok();
    let (app, _deps) = app_with(ProxyConfig::default(), upstream.clone());

    post_json(&app, "/v1/messages", chat_body("claude-sonnet-4-6", "hi"), &[]).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/runs?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let runs = body["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["routed_model"], "claude-sonnet-4-6");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn control_disable_turns_pipeline_off() {
    let upstream = StubUpstream::ok();
    let (app, deps) = app_with(ProxyConfig::default(), upstream.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/control/disable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!deps.enabled.load(std::sync::atomic::Ordering::Relaxed));

    // Requests now take the bypass path: no cache, no run records.
    let body = chat_body("claude-sonnet-4-6", "hi");
    post_json(&app, "/v1/messages", body.clone(), &[]).await;
    post_json(&app, "/v1/messages", body, &[]).await;
    assert_eq!(upstream.call_count(), 2);
    assert_eq!(deps.runs.stats().total_requests, 0);
}
