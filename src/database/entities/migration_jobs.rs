use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// One tracked invocation of an export/import/push/pull/restore operation.
///
/// Owned exclusively by the job registry; mutated only by the engine
/// currently executing the job. Jobs are never deleted, only retained.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub kind: String,
    pub status: String,
    pub progress_percent: i32,
    pub current_step: String,
    pub created_by: Option<String>,
    pub source_url: Option<String>,
    pub target_url: Option<String>,
    pub archive_path: Option<String>,
    pub archive_size_bytes: Option<i64>,
    pub total_entities: i32,
    pub entities_completed: i32,
    pub records_total: i64,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub files_total: i64,
    pub files_processed: i64,
    pub bytes_transferred: i64,
    pub started_at: Option<ChronoDateTimeUtc>,
    pub completed_at: Option<ChronoDateTimeUtc>,
    pub duration_seconds: Option<i64>,
    pub last_progress_at: Option<ChronoDateTimeUtc>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub checkpoint_id: Option<String>,
    pub cancel_requested: bool,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::migration_logs::Entity")]
    MigrationLogs,
    #[sea_orm(
        belongs_to = "super::migration_checkpoints::Entity",
        from = "Column::CheckpointId",
        to = "super::migration_checkpoints::Column::Id"
    )]
    MigrationCheckpoints,
}

impl Related<super::migration_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationLogs.def()
    }
}

impl Related<super::migration_checkpoints::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationCheckpoints.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    pub fn new(kind: &str, created_by: Option<String>) -> Self {
        Self {
            id: Set(Uuid::new_v4().to_string()),
            kind: Set(kind.to_string()),
            status: Set("created".to_string()),
            progress_percent: Set(0),
            current_step: Set(String::new()),
            created_by: Set(created_by),
            source_url: Set(None),
            target_url: Set(None),
            archive_path: Set(None),
            archive_size_bytes: Set(None),
            total_entities: Set(0),
            entities_completed: Set(0),
            records_total: Set(0),
            records_processed: Set(0),
            records_skipped: Set(0),
            files_total: Set(0),
            files_processed: Set(0),
            bytes_transferred: Set(0),
            started_at: Set(None),
            completed_at: Set(None),
            duration_seconds: Set(None),
            last_progress_at: Set(None),
            error_message: Set(None),
            error_detail: Set(None),
            checkpoint_id: Set(None),
            cancel_requested: Set(false),
            created_at: Set(chrono::Utc::now()),
        }
    }
}
