use std::path::{Component, Path, PathBuf};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sea_orm::EntityTrait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::archive::sha256_file;
use crate::database::entities::media_assets;
use crate::errors::MigrationError;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::{authorize, ensure_gate_open};
use crate::services::token_service::TokenPermission;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
    pub checksum: Option<String>,
}

/// Media paths are stored relative to the media root; anything that would
/// escape it is refused.
fn resolve_media_path(root: &Path, relative: &str) -> Result<PathBuf, MigrationError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(MigrationError::Validation(format!(
            "media path escapes the media root: {}",
            relative
        )));
    }
    Ok(root.join(candidate))
}

/// `GET /media-list`: inventory of media files known to the database.
pub async fn media_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    let assets = media_assets::Entity::find()
        .all(&state.db)
        .await
        .map_err(MigrationError::from)?;
    let listing = assets
        .into_iter()
        .map(|asset| {
            json!({
                "path": asset.file_path,
                "size_bytes": asset.size_bytes,
                "checksum": asset.checksum,
            })
        })
        .collect();
    Ok(Json(listing))
}

/// `GET /download-file?path=`: stream one media file's bytes.
pub async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers, TokenPermission::Read).await?;
    let full = resolve_media_path(&state.config.media_root, &query.path)?;
    if !full.is_file() {
        return Err(MigrationError::NotFound(format!("media file {}", query.path)).into());
    }
    let bytes = tokio::fs::read(&full)
        .await
        .map_err(MigrationError::from)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

/// `POST /receive-file?path=&checksum=`: accept one pushed media file,
/// verifying its checksum before it is considered received.
pub async fn receive_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    ensure_gate_open(&state)?;
    authorize(&state, &headers, TokenPermission::Write).await?;
    let expected = query.checksum.as_deref().ok_or_else(|| {
        MigrationError::Validation("receive-file requires a checksum parameter".to_string())
    })?;
    let full = resolve_media_path(&state.config.media_root, &query.path)?;
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(MigrationError::from)?;
    }
    tokio::fs::write(&full, &body)
        .await
        .map_err(MigrationError::from)?;
    let actual = sha256_file(&full)?;
    if actual != expected {
        tokio::fs::remove_file(&full).await.ok();
        return Err(MigrationError::Integrity(format!(
            "checksum mismatch for {}: expected {}, wrote {}",
            query.path, expected, actual
        ))
        .into());
    }
    Ok(Json(json!({
        "path": query.path,
        "size_bytes": body.len(),
        "checksum": actual,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_paths_are_refused() {
        let root = Path::new("/srv/media");
        assert!(resolve_media_path(root, "events/banner.png").is_ok());
        assert!(resolve_media_path(root, "../etc/passwd").is_err());
        assert!(resolve_media_path(root, "/etc/passwd").is_err());
        assert!(resolve_media_path(root, "a/../../b").is_err());
    }
}
