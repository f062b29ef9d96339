use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use crate::jobs::JobKind;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::{authorize, ensure_gate_open};
use crate::services::import_service::{ImportOptions, ImportService};
use crate::services::integrity_service::{IntegrityReport, IntegrityService};
use crate::services::token_service::TokenPermission;

/// `POST /receive-import?{options}`: accept a pushed archive body and
/// apply it as a background import job.
pub async fn receive_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(options): axum::extract::Query<ImportOptions>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    ensure_gate_open(&state)?;
    let token = authorize(&state, &headers, TokenPermission::Write).await?;
    let job = state
        .registry
        .create(JobKind::Import, Some(format!("token:{}", token.id)))
        .await?;
    let archive_path = state
        .config
        .archive_dir
        .join(format!("incoming-{}.tar.gz", job.id));
    tokio::fs::write(&archive_path, &body)
        .await
        .map_err(crate::errors::MigrationError::from)?;
    state
        .registry
        .set_archive(&job.id, &archive_path.to_string_lossy(), body.len() as i64)
        .await?;

    let importer = ImportService::new(
        state.db.clone(),
        state.config.clone(),
        state.registry.clone(),
        state.locks.clone(),
    );
    let job_id = job.id.clone();
    tokio::spawn(async move {
        // execute() records failure and rollback on the job itself.
        if let Err(err) = importer.execute(&job_id, &archive_path, &options).await {
            error!(job_id = %job_id, error = %err, "pushed import failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job.id }))))
}

/// `POST /verify`: run the referential integrity check on demand.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IntegrityReport>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    let report = IntegrityService::new(state.db.clone()).verify().await?;
    Ok(Json(report))
}

/// `POST /rollback/{job_id}`: restore the checkpoint of a failed import.
pub async fn rollback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_gate_open(&state)?;
    authorize(&state, &headers, TokenPermission::Write).await?;
    let importer = ImportService::new(
        state.db.clone(),
        state.config.clone(),
        state.registry.clone(),
        state.locks.clone(),
    );
    importer.roll_back(&job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "status": "rolled_back" })))
}
