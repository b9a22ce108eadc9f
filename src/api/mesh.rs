//! Mesh status and force-sync endpoints.

use axum::extract::State;
use axum::Json;

use crate::mesh::MeshStats;
use crate::AppState;

/// GET /v1/mesh/stats
pub async fn stats(State(state): State<AppState>) -> Json<MeshStats> {
    Json(state.mesh.stats())
}

/// POST /v1/mesh/sync
pub async fn sync(State(state): State<AppState>) -> Json<MeshStats> {
    let total_runs = state.runs.stats().total_requests;
    Json(state.mesh.sync(total_runs))
}
