//! Token gate for the migration surface.
//!
//! Calls present `Authorization: MigrationToken <value>`, a scheme distinct
//! from any user authentication. Each route names its required permission;
//! the token service records every accept and reject in the audit table.

use axum::http::HeaderMap;

use crate::database::entities::migration_tokens;
use crate::errors::{MigrationError, Result};
use crate::server::app::AppState;
use crate::services::token_service::TokenPermission;

pub const AUTH_SCHEME: &str = "MigrationToken";

fn presented_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            MigrationError::Authentication("missing Authorization header".to_string())
        })?;
    value
        .strip_prefix(AUTH_SCHEME)
        .map(|rest| rest.trim())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            MigrationError::Authentication(format!(
                "expected '{} <value>' authorization scheme",
                AUTH_SCHEME
            ))
        })
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

fn origin_domain(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::ORIGIN)
        .or_else(|| headers.get(axum::http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.trim_start_matches("https://")
                .trim_start_matches("http://")
                .split([':', '/'])
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

/// Validate the call's token for the route's required permission.
pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    required: TokenPermission,
) -> Result<migration_tokens::Model> {
    let token = presented_token(headers)?;
    state
        .tokens
        .validate(
            token,
            required,
            client_ip(headers).as_deref(),
            origin_domain(headers).as_deref(),
        )
        .await
}

/// 503 while a destructive restore holds the service gate.
pub fn ensure_gate_open(state: &AppState) -> std::result::Result<(), crate::server::error::ApiError> {
    if state.gate.is_paused() {
        return Err(crate::server::error::ApiError::Unavailable(
            "service paused for restore",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn parses_the_dedicated_scheme_only() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "MigrationToken mgt_abc".parse().unwrap());
        assert_eq!(presented_token(&headers).unwrap(), "mgt_abc");

        headers.insert(AUTHORIZATION, "Bearer mgt_abc".parse().unwrap());
        assert!(presented_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "MigrationToken ".parse().unwrap());
        assert!(presented_token(&headers).is_err());

        headers.remove(AUTHORIZATION);
        assert!(presented_token(&headers).is_err());
    }

    #[test]
    fn client_ip_uses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 192.168.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), Some("10.1.2.3".to_string()));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn origin_domain_strips_scheme_and_port() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::ORIGIN,
            "https://source.example.com:8443".parse().unwrap(),
        );
        assert_eq!(
            origin_domain(&headers),
            Some("source.example.com".to_string())
        );
    }
}
