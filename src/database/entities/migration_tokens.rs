use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Scoped, expiring credential for instance-to-instance migration calls.
///
/// Only the SHA-256 hash of the token value is stored; the raw value is
/// shown exactly once when the token is issued.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub token_hash: String,
    pub description: String,
    pub permission: String,
    /// JSON arrays; empty means unrestricted
    pub allowed_ips: String,
    pub allowed_domains: String,
    pub expires_at: ChronoDateTimeUtc,
    pub single_use: bool,
    pub used_at: Option<ChronoDateTimeUtc>,
    pub usage_count: i64,
    pub last_used_at: Option<ChronoDateTimeUtc>,
    pub last_used_ip: Option<String>,
    pub revoked_at: Option<ChronoDateTimeUtc>,
    pub created_by: Option<String>,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::migration_token_audits::Entity")]
    MigrationTokenAudits,
}

impl Related<super::migration_token_audits::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationTokenAudits.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
