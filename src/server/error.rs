use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::MigrationError;

/// HTTP-facing error: either a migration error mapped onto the status
/// taxonomy, or the 503 answered while the service gate is paused.
pub enum ApiError {
    Migration(MigrationError),
    Unavailable(&'static str),
}

impl From<MigrationError> for ApiError {
    fn from(err: MigrationError) -> Self {
        ApiError::Migration(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Migration(err) => {
                let status = match &err {
                    MigrationError::Validation(_) => StatusCode::BAD_REQUEST,
                    MigrationError::Authentication(_) => StatusCode::UNAUTHORIZED,
                    MigrationError::NotFound(_) => StatusCode::NOT_FOUND,
                    MigrationError::Conflict(_) | MigrationError::Cancelled(_) => {
                        StatusCode::CONFLICT
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = Json(json!({
                    "error": err.to_string(),
                    "code": err.error_code(),
                }));
                (status, body).into_response()
            }
            ApiError::Unavailable(reason) => {
                let body = Json(json!({ "error": reason, "code": "SERVICE_UNAVAILABLE" }));
                (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (MigrationError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                MigrationError::Authentication("x".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (MigrationError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (MigrationError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                MigrationError::FatalSystem("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::Migration(err).into_response().status(), expected);
        }
    }

    #[test]
    fn paused_gate_is_service_unavailable() {
        let response = ApiError::Unavailable("service paused for restore").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
