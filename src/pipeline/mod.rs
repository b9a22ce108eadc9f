//! Pipeline orchestrator.
//!
//! Drives every request through the stage order: parse -> model resolution ->
//! cache lookup -> budget precheck -> anomaly precheck -> auto-downgrade ->
//! complexity classification -> route selection -> cooldown filter -> auth ->
//! forward -> post-process, with cascade escalation re-entering the forward
//! stage. The orchestrator itself is stateless and reentrant; all
//! cross-request state lives in [`crate::Deps`].

pub mod context;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth;
use crate::cache::{self, CacheMetadata, CacheStatus};
use crate::clock::now_ms;
use crate::config::{BreachAction, DowngradeConfig, ProxyConfig, RoutingMode};
use crate::downgrade::{check_downgrade, DowngradeDecision};
use crate::envelope::{Envelope, IngressShape};
use crate::error::{suggest_models, AppError};
use crate::pipeline::context::RequestTrace;
use crate::providers::{
    self, translate, Provider, UpstreamRequest, UpstreamResponse,
};
use crate::router::cascade::{should_escalate, Cascade};
use crate::router::{self, classifier};
use crate::AppState;

// Response headers added by the proxy. Provider API keys never appear here.
const HDR_ROUTED_MODEL: &str = "x-relayplane-routed-model";
const HDR_ORIGINAL_MODEL: &str = "x-relayplane-original-model";
const HDR_CACHE: &str = "x-relayplane-cache";
const HDR_MODE: &str = "x-relayplane-mode";
const HDR_ESCALATIONS: &str = "x-relayplane-escalations";
const HDR_DOWNGRADED: &str = "x-relayplane-downgraded";
const HDR_DOWNGRADE_REASON: &str = "x-relayplane-downgrade-reason";

/// Incoming header that disables all pipeline logic for a request.
const HDR_BYPASS: &str = "x-relayplane-bypass";

/// Entry point used by the HTTP handlers. Errors become structured bodies.
pub async fn handle_chat(
    deps: AppState,
    ingress: IngressShape,
    headers: HeaderMap,
    body: Value,
) -> Response {
    match run_pipeline(deps, ingress, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run_pipeline(
    deps: AppState,
    ingress: IngressShape,
    headers: HeaderMap,
    body: Value,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let cfg = deps.config.read().expect("config lock poisoned").clone();

    // -- Stage: parse & normalize -------------------------------------------
    let mut env = Envelope::parse(ingress, body)?;

    let bypass_requested = headers
        .get(HDR_BYPASS)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if bypass_requested || !deps.enabled.load(Ordering::Relaxed) {
        debug!(request_id = %env.request_id, "Pipeline bypassed");
        return forward_bypass(&deps, &cfg, &env, &headers).await;
    }

    // -- Stage: model resolution --------------------------------------------
    let (resolved, hint) = router::resolve_model(&env.model, &cfg.routing);
    if !providers::is_known_model(&resolved) {
        return Err(AppError::UnknownModel {
            suggestions: suggest_models(&resolved, providers::known_models()),
            model: resolved,
        });
    }
    env.model = resolved;

    info!(
        request_id = %env.request_id,
        model = %env.model,
        original = %env.original_model,
        hint = ?hint,
        stream = env.stream,
        "Chat request"
    );

    // -- Stage: cache lookup -------------------------------------------------
    let cache_bypassed = cache::should_bypass(&env, &cfg.cache);
    let cache_key = (!cache_bypassed).then(|| cache::compute_key(&env, cfg.cache.mode));
    if cache_bypassed {
        deps.cache.record_bypass();
    }

    if let Some(ref key) = cache_key {
        if let Some((cached_body, meta)) = deps.cache.lookup(key) {
            let latency_ms = start.elapsed().as_millis() as u64;
            info!(request_id = %env.request_id, key = %key, latency_ms, "Cache hit");
            deps.runs.record(RequestTrace {
                request_id: env.request_id.to_string(),
                timestamp_ms: now_ms(),
                original_model: env.original_model.clone(),
                routed_model: env.model.clone(),
                mode: cfg.routing.mode.as_str().to_string(),
                cache: CacheStatus::Hit,
                downgraded: false,
                downgrade_reason: None,
                escalations: 0,
                tokens_in: meta.tokens_in,
                tokens_out: meta.tokens_out,
                cost_usd: 0.0,
                latency_ms,
                status: 200,
            });
            return Ok(proxy_response(
                StatusCode::OK,
                cached_body.as_ref().clone(),
                &env.model,
                &env.original_model,
                CacheStatus::Hit,
                cfg.routing.mode,
                0,
                None,
            ));
        }
    }

    // -- Stage: budget precheck ----------------------------------------------
    let estimated_cost = estimate_cost(&deps, &env);
    let check = deps.budget.check_budget(&cfg.budget, Some(estimated_cost));

    for threshold in &check.thresholds_crossed {
        if let Some(limit) = cfg.budget.daily_usd {
            deps.alerts
                .fire_threshold(&cfg.alerts, *threshold, check.current_daily_spend, limit);
        }
        deps.budget.mark_threshold_fired(*threshold);
    }

    let mut force_downgrade = false;
    if check.breached {
        deps.alerts
            .fire_breach(&cfg.alerts, check.breach_type, check.current_daily_spend);
        match check.action {
            BreachAction::Block => {
                return Err(AppError::BudgetExceeded(format!(
                    "daily spend ${:.2}; breach type {:?}",
                    check.current_daily_spend, check.breach_type
                )));
            }
            BreachAction::Warn => {
                warn!(
                    request_id = %env.request_id,
                    breach = ?check.breach_type,
                    daily_spend = check.current_daily_spend,
                    "Budget breached (warn mode)"
                );
            }
            BreachAction::Downgrade => force_downgrade = true,
            BreachAction::Alert => {}
        }
    }

    // -- Stage: anomaly precheck (read-only) ----------------------------------
    let active_anomalies = deps.anomaly.active();
    if !active_anomalies.is_empty() {
        warn!(
            request_id = %env.request_id,
            anomalies = ?active_anomalies,
            "Recent traffic flagged anomalous"
        );
    }

    // -- Stage: auto-downgrade -----------------------------------------------
    let utilization = deps.budget.utilization_percent(&cfg.budget);
    let downgrade = if force_downgrade {
        // Breach action "downgrade" forces the rewrite regardless of the
        // policy's own threshold.
        let forced = DowngradeConfig {
            enabled: true,
            threshold_percent: 0,
            mapping: cfg.downgrade.mapping.clone(),
        };
        check_downgrade(&env.model, utilization.max(100.0), &forced)
    } else {
        check_downgrade(&env.model, utilization, &cfg.downgrade)
    };
    if downgrade.downgraded {
        info!(
            request_id = %env.request_id,
            from = %downgrade.original_model,
            to = %downgrade.new_model,
            reason = %downgrade.reason,
            "Model downgraded"
        );
        env.model = downgrade.new_model.clone();
    }

    // -- Stage: complexity classification + route selection -------------------
    let complexity = classifier::classify(&env);
    let route = router::select_route(&env.model, complexity, &cfg.routing);

    // -- Stages: cooldown filter, auth, forward, cascade ----------------------
    let incoming_auth = auth::extract_incoming(&headers);
    let ladder = route
        .cascade_models
        .clone()
        .unwrap_or_else(|| vec![route.model.clone()]);
    let max_escalations = if route.mode == RoutingMode::Cascade {
        cfg.routing.cascade.max_escalations
    } else {
        0
    };
    let mut cascade = Cascade::new(ladder, max_escalations);

    let mut current = cascade.start().map(str::to_string);
    let mut last_failure: Option<AppError> = None;
    // A successful response that triggered escalation; served if the ladder
    // runs out.
    let mut fallback: Option<(UpstreamResponse, String)> = None;
    let mut outcome: Option<(UpstreamResponse, String)> = None;

    while let Some(model) = current.take() {
        let Some(provider) = Provider::from_model(&model) else {
            warn!(model = %model, "Route produced an unknown model, skipping");
            last_failure = Some(AppError::Internal(format!("unroutable model {model}")));
            current = cascade.on_trigger().map(str::to_string);
            continue;
        };

        // Cooldown filter.
        if deps.cooldown.is_cooled(provider.id()) {
            debug!(provider = %provider, "Provider cooling down, skipping");
            last_failure = Some(AppError::CooldownExhausted(format!(
                "provider {provider} is cooling down"
            )));
            current = cascade.on_trigger().map(str::to_string);
            continue;
        }

        // Auth selection. A credential mismatch aborts the whole request;
        // escalating cannot fix a 401.
        let env_key = std::env::var(provider.env_key_var()).ok();
        let outbound = auth::resolve_outbound(&incoming_auth, provider, &model, env_key.as_deref())?;

        let request = UpstreamRequest {
            provider,
            model: model.clone(),
            body: translate::body_for(&env, provider.wire(), &model),
            auth: outbound,
            timeout: Duration::from_secs(cfg.upstream.timeout_secs),
            stream: env.stream,
        };

        // Streaming relays bytes as they arrive; there is no cascade for
        // streams because a response cannot be spliced mid-flight.
        if env.stream {
            return forward_streaming(&deps, &cfg, &env, request, &downgrade, route.mode, start)
                .await;
        }

        match deps.upstream.forward(request).await {
            Ok(response) if response.is_success() => {
                deps.cooldown.record_success(provider.id());

                if route.mode == RoutingMode::Cascade {
                    let text = response.json().map(|v| translate::extract_text(&v));
                    if should_escalate(text.as_deref(), false) {
                        match cascade.on_trigger().map(str::to_string) {
                            Some(next) => {
                                info!(from = %model, to = %next, "Cascade escalating on response content");
                                fallback = Some((response, model));
                                current = Some(next);
                                continue;
                            }
                            None => {
                                // Out of ladder: serve what we have.
                                outcome = Some((response, model));
                                break;
                            }
                        }
                    }
                }

                cascade.on_success();
                outcome = Some((response, model));
                break;
            }
            Ok(response) => {
                let status = response.status;
                if status >= 500 || status == 429 {
                    deps.cooldown.record_failure(&cfg.cooldown, provider.id());
                }
                if status < 500 && status != 429 {
                    // Client-shaped upstream error: mirror it immediately.
                    return Err(AppError::UpstreamStatus {
                        status,
                        body: response.body,
                    });
                }
                warn!(provider = %provider, status, "Upstream server error");
                last_failure = Some(AppError::UpstreamStatus {
                    status,
                    body: response.body,
                });
                current = cascade.on_trigger().map(str::to_string);
            }
            Err(err) => {
                if err.is_provider_fault() {
                    deps.cooldown.record_failure(&cfg.cooldown, provider.id());
                }
                warn!(provider = %provider, error = %err, "Upstream transport failure");
                last_failure = Some(err.into());
                current = cascade.on_trigger().map(str::to_string);
            }
        }
    }

    let (response, routed_model) = match outcome.or(fallback) {
        Some(pair) => pair,
        None => {
            return Err(last_failure
                .unwrap_or_else(|| AppError::Internal("no forwarding attempt was made".into())));
        }
    };

    // -- Stage: response post-process -----------------------------------------
    let latency_ms = start.elapsed().as_millis() as u64;
    let response_json = response.json();
    let (tokens_in, tokens_out) = response_json
        .as_ref()
        .map(translate::extract_usage)
        .unwrap_or((0, 0));
    let cost_usd = deps.pricing.cost(&routed_model, tokens_in, tokens_out);

    deps.budget.record_spend(cost_usd, &routed_model);

    let anomalies = deps.anomaly.record_and_analyze(
        &cfg.anomaly,
        crate::anomaly::TraceEntry {
            timestamp_ms: now_ms(),
            model: routed_model.clone(),
            tokens_in,
            tokens_out,
            cost_usd,
        },
    );
    for anomaly in &anomalies {
        deps.alerts.fire_anomaly(&cfg.alerts, anomaly);
    }

    if let Some(ref key) = cache_key {
        let cacheable = !(cfg.cache.skip_tool_responses
            && response_json
                .as_ref()
                .is_some_and(translate::response_has_tool_calls));
        if cacheable {
            let ttl_ms = cfg.cache.ttl_secs_for(complexity.as_str()) * 1000;
            let created = now_ms();
            deps.cache.insert(
                key,
                response.body.clone(),
                CacheMetadata {
                    model: routed_model.clone(),
                    task_type: complexity,
                    tokens_in,
                    tokens_out,
                    cost_usd,
                    created_at_ms: created,
                    expires_at_ms: created + ttl_ms,
                    hit_count: 0,
                    size_bytes: 0,
                },
            );
        }
    }

    let cache_status = if cache_bypassed {
        CacheStatus::Bypass
    } else {
        CacheStatus::Miss
    };
    deps.runs.record(RequestTrace {
        request_id: env.request_id.to_string(),
        timestamp_ms: now_ms(),
        original_model: env.original_model.clone(),
        routed_model: routed_model.clone(),
        mode: route.mode.as_str().to_string(),
        cache: cache_status,
        downgraded: downgrade.downgraded,
        downgrade_reason: downgrade.downgraded.then(|| downgrade.reason.clone()),
        escalations: cascade.escalations(),
        tokens_in,
        tokens_out,
        cost_usd,
        latency_ms,
        status: response.status,
    });

    info!(
        request_id = %env.request_id,
        model = %routed_model,
        tokens_in,
        tokens_out,
        cost_usd,
        latency_ms,
        escalations = cascade.escalations(),
        "Request completed"
    );

    Ok(proxy_response(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
        response.body,
        &routed_model,
        &env.original_model,
        cache_status,
        route.mode,
        cascade.escalations(),
        downgrade.downgraded.then_some(&downgrade),
    ))
}

// ---------------------------------------------------------------------------
// Bypass and streaming paths
// ---------------------------------------------------------------------------

/// `X-RelayPlane-Bypass: true` (or a runtime disable): forward unchanged,
/// no cache, no records.
async fn forward_bypass(
    deps: &AppState,
    cfg: &ProxyConfig,
    env: &Envelope,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let Some(provider) = Provider::from_model(&env.model) else {
        return Err(AppError::UnknownModel {
            suggestions: suggest_models(&env.model, providers::known_models()),
            model: env.model.clone(),
        });
    };

    let incoming = auth::extract_incoming(headers);
    let env_key = std::env::var(provider.env_key_var()).ok();
    let outbound = auth::resolve_outbound(&incoming, provider, &env.model, env_key.as_deref())?;

    let request = UpstreamRequest {
        provider,
        model: env.model.clone(),
        body: env.raw.clone(),
        auth: outbound,
        timeout: Duration::from_secs(cfg.upstream.timeout_secs),
        stream: env.stream,
    };

    if env.stream {
        let streamed = deps.upstream.forward_stream(request).await?;
        return Ok(stream_response(streamed, &[]));
    }

    let response = deps.upstream.forward(request).await?;
    Ok(Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(response.body))
        .expect("static response parts are valid"))
}

/// Streaming relay: all pre-forward stages have run; the byte stream is
/// handed through as-is. Tokens are unknown here, so the trace records the
/// relay itself rather than spend.
async fn forward_streaming(
    deps: &AppState,
    cfg: &ProxyConfig,
    env: &Envelope,
    request: UpstreamRequest,
    downgrade: &DowngradeDecision,
    mode: RoutingMode,
    start: Instant,
) -> Result<Response, AppError> {
    let provider = request.provider;
    let routed_model = request.model.clone();
    let streamed = deps.upstream.forward_stream(request).await.map_err(|e| {
        if matches!(e, crate::providers::ProviderError::Transport(_))
            || matches!(e, crate::providers::ProviderError::Timeout { .. })
        {
            deps.cooldown.record_failure(&cfg.cooldown, provider.id());
        }
        AppError::from(e)
    })?;
    deps.cooldown.record_success(provider.id());

    deps.runs.record(RequestTrace {
        request_id: env.request_id.to_string(),
        timestamp_ms: now_ms(),
        original_model: env.original_model.clone(),
        routed_model: routed_model.clone(),
        mode: mode.as_str().to_string(),
        cache: CacheStatus::Bypass,
        downgraded: downgrade.downgraded,
        downgrade_reason: downgrade.downgraded.then(|| downgrade.reason.clone()),
        escalations: 0,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        latency_ms: start.elapsed().as_millis() as u64,
        status: streamed.status,
    });

    let mut extra = vec![
        (HDR_ROUTED_MODEL, routed_model),
        (HDR_ORIGINAL_MODEL, env.original_model.clone()),
        (HDR_CACHE, CacheStatus::Bypass.as_str().to_string()),
        (HDR_MODE, mode.as_str().to_string()),
        (HDR_ESCALATIONS, "0".to_string()),
    ];
    if downgrade.downgraded {
        extra.push((HDR_DOWNGRADED, "true".to_string()));
        extra.push((HDR_DOWNGRADE_REASON, downgrade.reason.clone()));
    }
    Ok(stream_response(streamed, &extra))
}

// ---------------------------------------------------------------------------
// Response builders
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn proxy_response(
    status: StatusCode,
    body: Vec<u8>,
    routed_model: &str,
    original_model: &str,
    cache: CacheStatus,
    mode: RoutingMode,
    escalations: u32,
    downgrade: Option<&DowngradeDecision>,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(HDR_ROUTED_MODEL, routed_model)
        .header(HDR_ORIGINAL_MODEL, original_model)
        .header(HDR_CACHE, cache.as_str())
        .header(HDR_MODE, mode.as_str())
        .header(HDR_ESCALATIONS, escalations.to_string());
    if let Some(decision) = downgrade {
        builder = builder
            .header(HDR_DOWNGRADED, "true")
            .header(HDR_DOWNGRADE_REASON, sanitize_header(&decision.reason));
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn stream_response(
    streamed: crate::providers::UpstreamStreamResponse,
    extra_headers: &[(&'static str, String)],
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(streamed.status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, streamed.content_type.clone());
    for (name, value) in extra_headers {
        builder = builder.header(*name, sanitize_header(value));
    }
    builder
        .body(Body::from_stream(streamed.stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Header values must be visible ASCII; replace anything else.
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '_' })
        .collect()
}

/// Pre-flight cost estimate for the budget per-request check: known pricing
/// over approximate input tokens and the requested output ceiling.
fn estimate_cost(deps: &AppState, env: &Envelope) -> f64 {
    let estimated_out = env.max_tokens.unwrap_or(1024);
    deps.pricing
        .cost(&env.model, env.approx_input_tokens(), estimated_out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_header_passes_ascii() {
        assert_eq!(sanitize_header("budget at 85%"), "budget at 85%");
    }

    #[test]
    fn test_sanitize_header_replaces_control_chars() {
        assert_eq!(sanitize_header("a\nb\u{7f}c"), "a_b_c");
    }

    #[test]
    fn test_proxy_response_headers() {
        let response = proxy_response(
            StatusCode::OK,
            b"{}".to_vec(),
            "claude-sonnet-4-6",
            "claude-opus-4-6",
            CacheStatus::Miss,
            RoutingMode::Passthrough,
            0,
            None,
        );
        let headers = response.headers();
        assert_eq!(headers[HDR_ROUTED_MODEL], "claude-sonnet-4-6");
        assert_eq!(headers[HDR_ORIGINAL_MODEL], "claude-opus-4-6");
        assert_eq!(headers[HDR_CACHE], "miss");
        assert_eq!(headers[HDR_MODE], "passthrough");
        assert_eq!(headers[HDR_ESCALATIONS], "0");
        assert!(headers.get(HDR_DOWNGRADED).is_none());
    }

    #[test]
    fn test_proxy_response_downgrade_headers() {
        let decision = DowngradeDecision {
            downgraded: true,
            original_model: "claude-opus-4-6".to_string(),
            new_model: "claude-sonnet-4-6".to_string(),
            reason: "budget at 85% of daily limit (threshold 80%)".to_string(),
        };
        let response = proxy_response(
            StatusCode::OK,
            b"{}".to_vec(),
            "claude-sonnet-4-6",
            "claude-opus-4-6",
            CacheStatus::Miss,
            RoutingMode::Passthrough,
            0,
            Some(&decision),
        );
        let headers = response.headers();
        assert_eq!(headers[HDR_DOWNGRADED], "true");
        assert!(headers
            .get(HDR_DOWNGRADE_REASON)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("85%"));
    }
}
