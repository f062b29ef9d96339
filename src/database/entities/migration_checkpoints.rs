use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of target state taken before a destructive
/// operation. Immutable once `is_valid` is set; the only path back to a
/// prior state.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migration_checkpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub snapshot_path: String,
    pub size_bytes: i64,
    pub total_records: i64,
    pub is_valid: bool,
    pub used_for_restore: bool,
    pub restored_at: Option<ChronoDateTimeUtc>,
    pub expires_at: Option<ChronoDateTimeUtc>,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::migration_jobs::Entity")]
    MigrationJobs,
}

impl Related<super::migration_jobs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => chrono::Utc::now() > expires_at,
            None => false,
        }
    }

    /// Usable for a restore: valid, unconsumed and not past expiry.
    pub fn is_restorable(&self) -> bool {
        self.is_valid && !self.used_for_restore && !self.is_expired()
    }
}

impl ActiveModel {
    pub fn new(name: String, snapshot_path: String, retention_days: i64) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::new_v4().to_string()),
            name: Set(name),
            snapshot_path: Set(snapshot_path),
            size_bytes: Set(0),
            total_records: Set(0),
            // Valid only after the snapshot write is confirmed durable
            is_valid: Set(false),
            used_for_restore: Set(false),
            restored_at: Set(None),
            expires_at: Set(Some(now + chrono::Duration::days(retention_days))),
            created_at: Set(now),
        }
    }
}
