use axum::extract::State;
use std::sync::Arc;

use crate::protocol::{AggregateGroupRequest, AggregateHostRequest, AggregateResponse, MsgPack};
use crate::AppState;

use super::AppError;

// ─── POST /aggregate/host ────────────────────────────────────────

/// Reduces one host's payload to a partial result. The reduction runs on
/// the blocking pool, whose size bounds concurrent aggregations.
pub async fn aggregate_host(
    State(state): State<Arc<AppState>>,
    MsgPack(request): MsgPack<AggregateHostRequest>,
) -> Result<MsgPack<AggregateResponse>, AppError> {
    let service = Arc::clone(&state.service);
    let response = tokio::task::spawn_blocking(move || service.aggregate_host(&request))
        .await
        .map_err(|e| AppError::Internal(format!("aggregation task failed: {e}")))??;
    Ok(MsgPack(response))
}

// ─── POST /aggregate/group ───────────────────────────────────────

pub async fn aggregate_group(
    State(state): State<Arc<AppState>>,
    MsgPack(request): MsgPack<AggregateGroupRequest>,
) -> Result<MsgPack<AggregateResponse>, AppError> {
    let service = Arc::clone(&state.service);
    let response = tokio::task::spawn_blocking(move || service.aggregate_group(&request))
        .await
        .map_err(|e| AppError::Internal(format!("aggregation task failed: {e}")))??;
    Ok(MsgPack(response))
}
