//! HTTP surface.
//!
//! Route layout:
//! ```text
//! /v1/messages                 POST   Anthropic-shape ingress
//! /v1/chat/completions         POST   OpenAI-shape ingress
//! /health                      GET    liveness + uptime
//! /stats                       GET    aggregate counters
//! /runs?limit=N                GET    recent request traces
//! /v1/telemetry/stats          GET
//! /v1/telemetry/runs           GET
//! /v1/telemetry/savings        GET
//! /v1/telemetry/health         GET
//! /control/status              GET/POST
//! /control/enable              GET/POST
//! /control/disable             GET/POST
//! /control/config              GET/POST
//! /v1/mesh/stats               GET
//! /v1/mesh/sync                POST
//! ```

pub mod chat;
pub mod control;
pub mod health;
pub mod mesh;
pub mod telemetry;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Build the full router.
pub fn build_router() -> Router<AppState> {
    let control_routes = Router::new()
        .route("/status", get(control::status).post(control::status))
        .route("/enable", get(control::enable).post(control::enable))
        .route("/disable", get(control::disable).post(control::disable))
        .route("/config", get(control::get_config).post(control::set_config));

    let telemetry_routes = Router::new()
        .route("/stats", get(telemetry::stats))
        .route("/runs", get(telemetry::runs))
        .route("/savings", get(telemetry::savings))
        .route("/health", get(health::health));

    Router::new()
        .route("/v1/messages", post(chat::anthropic_messages))
        .route("/v1/chat/completions", post(chat::openai_chat))
        .route("/health", get(health::health))
        .route("/stats", get(telemetry::stats))
        .route("/runs", get(telemetry::runs))
        .route("/v1/mesh/stats", get(mesh::stats))
        .route("/v1/mesh/sync", post(mesh::sync))
        .nest("/v1/telemetry", telemetry_routes)
        .nest("/control", control_routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_router_creates_router() {
        // Smoke test: ensure the router builds without panicking.
        let _router: Router<AppState> = build_router();
    }
}
