use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::entities::{migration_token_audits, migration_tokens};
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::authorize;
use crate::services::token_service::{IssueTokenRequest, TokenPermission};

#[derive(Debug, Deserialize)]
pub struct CreateTokenBody {
    pub description: String,
    pub permission: Option<TokenPermission>,
    pub expires_in_hours: Option<i64>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub single_use: bool,
}

/// `POST /tokens`: mint a token. The raw value appears in this response
/// and nowhere else; only its hash is stored.
pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let issuer = authorize(&state, &headers, TokenPermission::Admin).await?;
    let issued = state
        .tokens
        .issue(IssueTokenRequest {
            description: body.description,
            permission: body.permission,
            expires_in_hours: body.expires_in_hours,
            allowed_ips: body.allowed_ips,
            allowed_domains: body.allowed_domains,
            single_use: body.single_use,
            created_by: Some(format!("token:{}", issuer.id)),
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": issued.token,
            "id": issued.model.id,
            "permission": issued.model.permission,
            "expires_at": issued.model.expires_at,
        })),
    ))
}

/// `GET /tokens`: hashed records only, never raw values.
pub async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<migration_tokens::Model>>, ApiError> {
    authorize(&state, &headers, TokenPermission::Admin).await?;
    Ok(Json(state.tokens.list().await?))
}

/// `DELETE /tokens/{token_id}`: revoke, keeping the row for audit history.
pub async fn revoke_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token_id): Path<String>,
) -> Result<Json<migration_tokens::Model>, ApiError> {
    authorize(&state, &headers, TokenPermission::Admin).await?;
    Ok(Json(state.tokens.revoke(&token_id).await?))
}

/// `GET /tokens/{token_id}/audits`
pub async fn token_audits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token_id): Path<String>,
) -> Result<Json<Vec<migration_token_audits::Model>>, ApiError> {
    authorize(&state, &headers, TokenPermission::Admin).await?;
    Ok(Json(state.tokens.audits_for(&token_id).await?))
}
