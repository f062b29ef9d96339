use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::database::entities::{migration_jobs, migration_logs};
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::authorize;
use crate::services::token_service::TokenPermission;

/// `GET /jobs`: all jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<migration_jobs::Model>>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    Ok(Json(state.registry.list().await?))
}

/// `GET /jobs/{job_id}`
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<migration_jobs::Model>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    Ok(Json(state.registry.get(&job_id).await?))
}

/// `GET /jobs/{job_id}/logs`: ordered log lines for one job.
pub async fn job_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<migration_logs::Model>>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    state.registry.get(&job_id).await?;
    Ok(Json(state.registry.logs(&job_id).await?))
}

/// `POST /jobs/{job_id}/cancel`: cooperative cancellation. The running
/// phase observes the flag at its next chunk boundary.
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers, TokenPermission::Write).await?;
    state.registry.request_cancel(&job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "cancel_requested": true })))
}
