//! Runtime control endpoints.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    pub uptime_secs: u64,
    pub version: String,
}

/// GET/POST /control/status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        enabled: state.enabled.load(Ordering::Relaxed),
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET/POST /control/enable
pub async fn enable(State(state): State<AppState>) -> Json<StatusResponse> {
    state.enabled.store(true, Ordering::Relaxed);
    info!("Proxy pipeline enabled");
    status(State(state)).await
}

/// GET/POST /control/disable
///
/// While disabled every request takes the bypass path: forwarded unchanged,
/// no cache, no records.
pub async fn disable(State(state): State<AppState>) -> Json<StatusResponse> {
    state.enabled.store(false, Ordering::Relaxed);
    info!("Proxy pipeline disabled");
    status(State(state)).await
}

/// GET /control/config
///
/// The config never carries credentials, so it is returned as-is.
pub async fn get_config(State(state): State<AppState>) -> Json<ProxyConfig> {
    Json(state.config.read().expect("config lock poisoned").clone())
}

/// POST /control/config
///
/// Replace the runtime config and persist it atomically.
pub async fn set_config(
    State(state): State<AppState>,
    Json(new_config): Json<ProxyConfig>,
) -> Result<Json<ProxyConfig>, AppError> {
    {
        let mut config = state.config.write().expect("config lock poisoned");
        *config = new_config.clone();
    }
    if let Err(e) = new_config.save(&state.config_path) {
        warn!(error = %e, "Config updated in memory but could not be persisted");
    }
    info!("Configuration updated");
    Ok(Json(new_config))
}
