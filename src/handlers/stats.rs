use axum::{extract::State, Json};
use std::sync::Arc;

use crate::metrics::StatsSnapshot;
use crate::AppState;

// ─── GET /stats ──────────────────────────────────────────────────
/// Per-worker request statistics as JSON, for curl / debugging.

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
