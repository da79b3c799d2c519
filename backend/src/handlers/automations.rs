// Operational endpoints for the automation engine: monitoring pending
// executions, manual cancellation, and an on-demand expiry sweep. These are
// intervention tools, not a CRUD surface.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pending", get(list_pending_executions))
        .route("/conversations/:id/status", get(conversation_status))
        .route("/conversations/:id/cancel", post(cancel_conversation))
        .route("/sweep", post(sweep_now))
}

/// All pending executions across conversations; monitoring dashboard feed.
async fn list_pending_executions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let executions = state.pending.list_all().await?;
    Ok(Json(serde_json::json!({
        "total_count": executions.len(),
        "executions": executions,
    })))
}

async fn conversation_status(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let pending = state.pending.get(conversation_id).await?;
    Ok(Json(serde_json::json!({
        "conversation_id": conversation_id,
        "has_pending_execution": pending.is_some(),
        "pending_execution": pending,
    })))
}

async fn cancel_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.engine.cancel(conversation_id).await?;
    Ok(Json(serde_json::json!({
        "success": cancelled,
        "conversation_id": conversation_id,
        "message": if cancelled {
            "Automation execution cancelled successfully"
        } else {
            "No pending execution found for this conversation"
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct SweepParams {
    /// Expire entries older than this many minutes instead of honoring each
    /// entry's recorded deadline.
    pub timeout_minutes: Option<i64>,
}

async fn sweep_now(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SweepParams>,
) -> ApiResult<impl IntoResponse> {
    let timeout = params.timeout_minutes.map(Duration::minutes);
    let report = state.engine.sweep_expired(timeout).await;
    Ok(Json(serde_json::json!({
        "success": report.errors.is_empty(),
        "scanned": report.scanned,
        "cleaned_count": report.expired,
        "errors": report.errors,
    })))
}
