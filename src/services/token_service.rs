//! Token authority for instance-to-instance migration calls.
//!
//! Tokens are distinct from normal user authentication. The raw value is
//! returned exactly once at issue time and only its SHA-256 hash is stored,
//! so a leaked database never yields a usable credential. Every validation
//! outcome, accept or reject, lands in `migration_token_audits`.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::sha256_hex;
use crate::database::entities::{migration_token_audits, migration_tokens};
use crate::errors::{MigrationError, Result};

pub const TOKEN_PREFIX: &str = "mgt_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPermission {
    Read,
    Write,
    ReadWrite,
    Admin,
}

impl TokenPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPermission::Read => "read",
            TokenPermission::Write => "write",
            TokenPermission::ReadWrite => "read_write",
            TokenPermission::Admin => "admin",
        }
    }

    /// Whether a token holding `self` may perform a call requiring
    /// `required`. Read-only tokens can never back a write call.
    pub fn grants(&self, required: TokenPermission) -> bool {
        match required {
            TokenPermission::Read => !matches!(self, TokenPermission::Write),
            TokenPermission::Write => matches!(
                self,
                TokenPermission::Write | TokenPermission::ReadWrite | TokenPermission::Admin
            ),
            TokenPermission::ReadWrite => {
                matches!(self, TokenPermission::ReadWrite | TokenPermission::Admin)
            }
            TokenPermission::Admin => matches!(self, TokenPermission::Admin),
        }
    }
}

impl std::fmt::Display for TokenPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenPermission {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(TokenPermission::Read),
            "write" => Ok(TokenPermission::Write),
            "read_write" => Ok(TokenPermission::ReadWrite),
            "admin" => Ok(TokenPermission::Admin),
            other => Err(MigrationError::Validation(format!(
                "unknown token permission: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueTokenRequest {
    pub description: String,
    pub permission: Option<TokenPermission>,
    pub expires_in_hours: Option<i64>,
    pub allowed_ips: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub single_use: bool,
    pub created_by: Option<String>,
}

/// The only place the raw token value ever appears.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub model: migration_tokens::Model,
}

#[derive(Clone)]
pub struct TokenService {
    db: DatabaseConnection,
    default_ttl_hours: i64,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, default_ttl_hours: i64) -> Self {
        Self {
            db,
            default_ttl_hours,
        }
    }

    pub async fn issue(&self, request: IssueTokenRequest) -> Result<IssuedToken> {
        let permission = request.permission.unwrap_or(TokenPermission::Read);
        let ttl_hours = request.expires_in_hours.unwrap_or(self.default_ttl_hours);
        if ttl_hours <= 0 {
            return Err(MigrationError::Validation(
                "token lifetime must be positive".to_string(),
            ));
        }
        let raw = format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().simple());
        let now = Utc::now();
        let model = migration_tokens::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            token_hash: Set(sha256_hex(raw.as_bytes())),
            description: Set(request.description),
            permission: Set(permission.as_str().to_string()),
            allowed_ips: Set(serde_json::to_string(&request.allowed_ips)?),
            allowed_domains: Set(serde_json::to_string(&request.allowed_domains)?),
            expires_at: Set(now + Duration::hours(ttl_hours)),
            single_use: Set(request.single_use),
            used_at: Set(None),
            usage_count: Set(0),
            last_used_at: Set(None),
            last_used_ip: Set(None),
            revoked_at: Set(None),
            created_by: Set(request.created_by),
            created_at: Set(now),
        }
        .insert(&self.db)
        .await?;
        info!(token_id = %model.id, permission = %permission, "issued migration token");
        Ok(IssuedToken { token: raw, model })
    }

    pub async fn list(&self) -> Result<Vec<migration_tokens::Model>> {
        Ok(migration_tokens::Entity::find()
            .order_by_desc(migration_tokens::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn revoke(&self, token_id: &str) -> Result<migration_tokens::Model> {
        let token = migration_tokens::Entity::find_by_id(token_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("token {}", token_id)))?;
        let mut am = token.into_active_model();
        am.revoked_at = Set(Some(Utc::now()));
        let revoked = am.update(&self.db).await?;
        info!(token_id, "revoked migration token");
        Ok(revoked)
    }

    /// Validate a presented raw token for a call requiring `required`.
    /// Every outcome is audited; rejects come back as `Authentication`.
    pub async fn validate(
        &self,
        presented: &str,
        required: TokenPermission,
        client_ip: Option<&str>,
        origin_domain: Option<&str>,
    ) -> Result<migration_tokens::Model> {
        let hash = sha256_hex(presented.as_bytes());
        let token = migration_tokens::Entity::find()
            .filter(migration_tokens::Column::TokenHash.eq(hash))
            .one(&self.db)
            .await?;

        let token = match token {
            Some(token) => token,
            None => {
                self.audit(None, "rejected", Some("unknown token"), client_ip)
                    .await?;
                return Err(MigrationError::Authentication(
                    "unknown token".to_string(),
                ));
            }
        };

        if let Some(reason) = self
            .rejection_reason(&token, required, client_ip, origin_domain)
            .await?
        {
            self.audit(Some(&token.id), "rejected", Some(&reason), client_ip)
                .await?;
            warn!(token_id = %token.id, reason, "rejected migration token");
            return Err(MigrationError::Authentication(reason));
        }

        let now = Utc::now();
        let single_use = token.single_use;
        let usage_count = token.usage_count;
        let token_id = token.id.clone();
        let mut am = token.into_active_model();
        am.usage_count = Set(usage_count + 1);
        am.last_used_at = Set(Some(now));
        am.last_used_ip = Set(client_ip.map(|ip| ip.to_string()));
        if single_use {
            am.used_at = Set(Some(now));
        }
        let accepted = am.update(&self.db).await?;
        self.audit(Some(&token_id), "accepted", None, client_ip)
            .await?;
        Ok(accepted)
    }

    async fn rejection_reason(
        &self,
        token: &migration_tokens::Model,
        required: TokenPermission,
        client_ip: Option<&str>,
        origin_domain: Option<&str>,
    ) -> Result<Option<String>> {
        if token.revoked_at.is_some() {
            return Ok(Some("token revoked".to_string()));
        }
        if token.expires_at < Utc::now() {
            return Ok(Some("token expired".to_string()));
        }
        if token.single_use && token.used_at.is_some() {
            return Ok(Some("single-use token already consumed".to_string()));
        }
        let allowed_ips: Vec<String> = serde_json::from_str(&token.allowed_ips)?;
        if !allowed_ips.is_empty() {
            match client_ip {
                Some(ip) if allowed_ips.iter().any(|a| a == ip) => {}
                _ => return Ok(Some("client address not in allowlist".to_string())),
            }
        }
        let allowed_domains: Vec<String> = serde_json::from_str(&token.allowed_domains)?;
        if !allowed_domains.is_empty() {
            match origin_domain {
                Some(domain)
                    if allowed_domains
                        .iter()
                        .any(|a| a == domain || domain.ends_with(&format!(".{}", a))) => {}
                _ => return Ok(Some("origin domain not in allowlist".to_string())),
            }
        }
        let held: TokenPermission = token.permission.parse()?;
        if !held.grants(required) {
            return Ok(Some(format!(
                "permission {} does not cover required {}",
                held, required
            )));
        }
        Ok(None)
    }

    async fn audit(
        &self,
        token_id: Option<&str>,
        outcome: &str,
        detail: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<()> {
        migration_token_audits::ActiveModel {
            id: sea_orm::NotSet,
            token_id: Set(token_id.map(|id| id.to_string())),
            outcome: Set(outcome.to_string()),
            detail: Set(detail.map(|d| d.to_string())),
            client_ip: Set(client_ip.map(|ip| ip.to_string())),
            timestamp: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn audits_for(
        &self,
        token_id: &str,
    ) -> Result<Vec<migration_token_audits::Model>> {
        Ok(migration_token_audits::Entity::find()
            .filter(migration_token_audits::Column::TokenId.eq(token_id))
            .order_by_asc(migration_token_audits::Column::Id)
            .all(&self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_lattice() {
        assert!(TokenPermission::Read.grants(TokenPermission::Read));
        assert!(!TokenPermission::Read.grants(TokenPermission::Write));
        assert!(!TokenPermission::Read.grants(TokenPermission::Admin));

        assert!(TokenPermission::Write.grants(TokenPermission::Write));
        assert!(!TokenPermission::Write.grants(TokenPermission::Read));

        assert!(TokenPermission::ReadWrite.grants(TokenPermission::Read));
        assert!(TokenPermission::ReadWrite.grants(TokenPermission::Write));
        assert!(!TokenPermission::ReadWrite.grants(TokenPermission::Admin));

        assert!(TokenPermission::Admin.grants(TokenPermission::Read));
        assert!(TokenPermission::Admin.grants(TokenPermission::Write));
        assert!(TokenPermission::Admin.grants(TokenPermission::Admin));
    }

    #[test]
    fn permission_parses_and_round_trips() {
        for p in [
            TokenPermission::Read,
            TokenPermission::Write,
            TokenPermission::ReadWrite,
            TokenPermission::Admin,
        ] {
            assert_eq!(p.as_str().parse::<TokenPermission>().unwrap(), p);
        }
        assert!("root".parse::<TokenPermission>().is_err());
    }
}
