use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::cooldown::CooldownRecord;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub enabled: bool,
    pub uptime_secs: u64,
    pub version: String,
    pub cooldowns: HashMap<String, CooldownRecord>,
}

/// GET /health
///
/// Liveness plus uptime and the current provider cooldown picture.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        enabled: state.enabled.load(Ordering::Relaxed),
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cooldowns: state.cooldown.snapshot(),
    })
}
