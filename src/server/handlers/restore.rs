use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::error;

use crate::errors::MigrationError;
use crate::jobs::JobKind;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::{authorize, ensure_gate_open};
use crate::services::restore::RestoreOrchestrator;
use crate::services::token_service::TokenPermission;

/// `POST /backup/upload`: save an uploaded backup bundle and create the
/// restore job for it. The destructive restore itself only runs once
/// `POST /backup/restore/{job_id}` confirms.
pub async fn upload_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    ensure_gate_open(&state)?;
    let token = authorize(&state, &headers, TokenPermission::Admin).await?;
    if body.is_empty() {
        return Err(MigrationError::Validation("empty backup upload".to_string()).into());
    }
    let job = state
        .registry
        .create(JobKind::Restore, Some(format!("token:{}", token.id)))
        .await?;
    let bundle_path = state
        .config
        .archive_dir
        .join(format!("bundle-{}.tar.gz", job.id));
    tokio::fs::write(&bundle_path, &body)
        .await
        .map_err(MigrationError::from)?;
    state
        .registry
        .set_archive(&job.id, &bundle_path.to_string_lossy(), body.len() as i64)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": job.id, "size_bytes": body.len() })),
    ))
}

/// `POST /backup/restore/{job_id}`: confirmation step. Kicks off the
/// destructive restore in the background.
pub async fn run_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    ensure_gate_open(&state)?;
    authorize(&state, &headers, TokenPermission::Admin).await?;
    let job = state.registry.get(&job_id).await?;
    if job.kind != "restore" {
        return Err(MigrationError::Validation(format!(
            "job {} is a {} job, not a restore",
            job_id, job.kind
        ))
        .into());
    }
    let bundle_path: PathBuf = job
        .archive_path
        .ok_or_else(|| MigrationError::NotFound(format!("job {} has no uploaded bundle", job_id)))?
        .into();

    let orchestrator = RestoreOrchestrator::new(
        state.db.clone(),
        state.config.clone(),
        state.registry.clone(),
        state.gate.clone(),
        state.locks.clone(),
    );
    let spawned_id = job_id.clone();
    tokio::spawn(async move {
        // execute() marks the job failed on any error path.
        if let Err(err) = orchestrator.execute(&spawned_id, &bundle_path).await {
            error!(job_id = %spawned_id, error = %err, "restore failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}
