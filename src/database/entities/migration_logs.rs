use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only log line for a migration job, ordered by sequence number.
/// Never mutated or reordered once written.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub job_id: String,
    pub seq: i64,
    pub timestamp: ChronoDateTimeUtc,
    pub level: String,
    pub message: String,
    pub entity_kind: Option<String>,
    pub record_count: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::migration_jobs::Entity",
        from = "Column::JobId",
        to = "super::migration_jobs::Column::Id"
    )]
    MigrationJobs,
}

impl Related<super::migration_jobs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
