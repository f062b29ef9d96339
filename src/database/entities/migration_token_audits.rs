use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Audit record for a single authentication attempt against a migration
/// token. Written for every outcome, success or failure, independent of
/// job logs.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_token_audits")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub token_id: Option<String>,
    pub outcome: String,
    pub detail: Option<String>,
    pub client_ip: Option<String>,
    pub timestamp: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::migration_tokens::Entity",
        from = "Column::TokenId",
        to = "super::migration_tokens::Column::Id"
    )]
    MigrationTokens,
}

impl Related<super::migration_tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationTokens.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
