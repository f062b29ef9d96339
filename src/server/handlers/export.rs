use std::io::SeekFrom;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::error;

use crate::database::entities::migration_jobs;
use crate::errors::MigrationError;
use crate::jobs::JobKind;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::authorize;
use crate::services::export_service::{ExportOptions, ExportService};
use crate::services::token_service::TokenPermission;

/// `POST /export`: start an export job and return its id immediately.
#[utoipa::path(
    post,
    path = "/api/v1/migration/export",
    responses(
        (status = 202, description = "Export job accepted"),
        (status = 401, description = "Token rejected")
    )
)]
pub async fn start_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(options): Json<ExportOptions>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let token = authorize(&state, &headers, TokenPermission::Read).await?;
    options.selected_kinds()?;
    let job = state
        .registry
        .create(JobKind::Export, Some(format!("token:{}", token.id)))
        .await?;
    let exporter = ExportService::new(state.db.clone(), state.config.clone(), state.registry.clone());
    let registry = state.registry.clone();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        if let Err(err) = exporter.run(&job_id, &options).await {
            if let Err(fail_err) = registry.fail(&job_id, &err).await {
                error!(job_id = %job_id, error = %fail_err, "could not record export failure");
            }
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job.id }))))
}

/// `GET /export-status/{job_id}`
pub async fn export_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<migration_jobs::Model>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    Ok(Json(state.registry.get(&job_id).await?))
}

/// `GET /download-export/{job_id}`: archive bytes streamed from disk,
/// honoring a single `Range: bytes=a-b` request.
pub async fn download_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    let job = state.registry.get(&job_id).await?;
    let path = job.archive_path.ok_or_else(|| {
        MigrationError::NotFound(format!("job {} has no archive", job_id))
    })?;
    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(MigrationError::from)?;
    let total = file
        .metadata()
        .await
        .map_err(MigrationError::from)?
        .len();

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        let (start, end) = parse_byte_range(range, total)?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(MigrationError::from)?;
        let len = end - start + 1;
        let body = Body::from_stream(ReaderStream::new(file.take(len)));
        let response = (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "application/gzip".to_string()),
                (header::CONTENT_LENGTH, len.to_string()),
                (
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                ),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            body,
        );
        return Ok(response.into_response());
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_LENGTH, total.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        body,
    )
        .into_response())
}

/// Parse `bytes=a-b` (or `bytes=a-`) into an inclusive range.
fn parse_byte_range(raw: &str, total: u64) -> Result<(u64, u64), MigrationError> {
    let invalid = || MigrationError::Validation(format!("unsupported range: {}", raw));
    let spec = raw.strip_prefix("bytes=").ok_or_else(invalid)?;
    let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.parse().map_err(|_| invalid())?;
    let end: u64 = if end.is_empty() {
        total.saturating_sub(1)
    } else {
        end.parse().map_err(|_| invalid())?
    };
    if start > end || end >= total {
        return Err(MigrationError::Validation(format!(
            "range {} out of bounds for {} bytes",
            raw, total
        )));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges_parse_inclusively() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000).unwrap(), (0, 99));
        assert_eq!(parse_byte_range("bytes=500-", 1000).unwrap(), (500, 999));
        assert!(parse_byte_range("bytes=900-1000", 1000).is_err());
        assert!(parse_byte_range("bytes=50-10", 1000).is_err());
        assert!(parse_byte_range("items=0-5", 1000).is_err());
    }
}
