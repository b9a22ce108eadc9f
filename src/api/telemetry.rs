//! Read-only telemetry views.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::pipeline::context::{RequestTrace, RunStats};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub runs: RunStats,
    pub cache: CacheStats,
}

/// GET /stats and GET /v1/telemetry/stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        runs: state.runs.stats(),
        cache: state.cache.stats(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RequestTrace>,
}

/// GET /runs?limit=N and GET /v1/telemetry/runs
pub async fn runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Json<RunsResponse> {
    let limit = query.limit.unwrap_or(50).min(100);
    Json(RunsResponse {
        runs: state.runs.recent(limit),
    })
}

#[derive(Debug, Serialize)]
pub struct SavingsResponse {
    /// Cost avoided by cache hits.
    pub saved_cost_usd: f64,
    /// Cost actually spent on forwarded requests.
    pub spent_cost_usd: f64,
    pub cache_hits: u64,
}

/// GET /v1/telemetry/savings
pub async fn savings(State(state): State<AppState>) -> Json<SavingsResponse> {
    let cache = state.cache.stats();
    let runs = state.runs.stats();
    Json(SavingsResponse {
        saved_cost_usd: cache.saved_cost_usd,
        spent_cost_usd: runs.total_cost_usd,
        cache_hits: cache.hits,
    })
}
