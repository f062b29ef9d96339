//! Checkpoint store: full pre-mutation snapshots of the target's entity
//! data, used exclusively for rollback.
//!
//! A checkpoint is a media-less export archive. `is_valid` flips to true
//! only after the snapshot file is durable on disk; the import engine will
//! not mutate anything until that happens. Restore deletes platform rows in
//! reverse dependency order, re-applies the snapshot with the overwrite
//! policy, verifies counts, then invalidates the checkpoint.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::path::Path;
use tracing::{info, warn};

use crate::archive::ArchiveReader;
use crate::catalog::{adapters, ApplyPolicy};
use crate::config::EngineConfig;
use crate::database::entities::migration_checkpoints;
use crate::errors::{MigrationError, Result};
use crate::jobs::JobRegistry;
use crate::services::export_service::{ExportOptions, ExportService};

#[derive(Clone)]
pub struct CheckpointService {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
}

impl CheckpointService {
    pub fn new(db: DatabaseConnection, config: EngineConfig, registry: JobRegistry) -> Self {
        Self {
            db,
            config,
            registry,
        }
    }

    /// Snapshot the current entity state. The checkpoint row exists as
    /// invalid while the snapshot is being written and becomes valid only
    /// once the archive is finished and fsynced.
    pub async fn create(&self, name: &str) -> Result<migration_checkpoints::Model> {
        let file_name = format!(
            "checkpoint-{}.tar.gz",
            Utc::now().format("%Y%m%d-%H%M%S%.3f")
        );
        let path = self.config.checkpoint_dir.join(&file_name);
        let checkpoint = migration_checkpoints::ActiveModel::new(
            name.to_string(),
            path.to_string_lossy().into_owned(),
            self.config.checkpoint_retention_days,
        )
        .insert(&self.db)
        .await?;

        let exporter = ExportService::new(
            self.db.clone(),
            self.config.clone(),
            self.registry.clone(),
        );
        let options = ExportOptions {
            include_media: false,
            ..Default::default()
        };
        let summary = match exporter.export_to_file(&path, &options, None).await {
            Ok(summary) => summary,
            Err(err) => {
                // Leave the row behind as invalid; the file may be partial.
                let _ = std::fs::remove_file(&path);
                warn!(checkpoint_id = %checkpoint.id, error = %err, "checkpoint snapshot failed");
                return Err(err);
            }
        };

        let id = checkpoint.id.clone();
        let mut am = checkpoint.into_active_model();
        am.size_bytes = Set(summary.archive_size_bytes as i64);
        am.total_records = Set(summary.records as i64);
        am.is_valid = Set(true);
        let checkpoint = am.update(&self.db).await?;
        info!(checkpoint_id = %id, records = summary.records, "checkpoint created");
        Ok(checkpoint)
    }

    pub async fn get(&self, checkpoint_id: &str) -> Result<migration_checkpoints::Model> {
        migration_checkpoints::Entity::find_by_id(checkpoint_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("checkpoint {}", checkpoint_id)))
    }

    pub async fn list(&self) -> Result<Vec<migration_checkpoints::Model>> {
        Ok(migration_checkpoints::Entity::find()
            .order_by_desc(migration_checkpoints::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn latest_valid(&self) -> Result<Option<migration_checkpoints::Model>> {
        let candidate = migration_checkpoints::Entity::find()
            .filter(migration_checkpoints::Column::IsValid.eq(true))
            .order_by_desc(migration_checkpoints::Column::CreatedAt)
            .one(&self.db)
            .await?;
        Ok(candidate.filter(|c| c.is_restorable()))
    }

    /// Replace current entity state with the snapshot's state. The single
    /// code path behind both manual and automatic rollback.
    pub async fn restore(&self, checkpoint_id: &str) -> Result<()> {
        let checkpoint = self.get(checkpoint_id).await?;
        if !checkpoint.is_valid || checkpoint.used_for_restore {
            return Err(MigrationError::Validation(format!(
                "checkpoint {} is no longer valid",
                checkpoint_id
            )));
        }
        if checkpoint.is_expired() {
            return Err(MigrationError::Validation(format!(
                "checkpoint {} has expired",
                checkpoint_id
            )));
        }

        let reader = ArchiveReader::open(Path::new(&checkpoint.snapshot_path))?;
        reader.validate()?;
        let manifest = reader.manifest().clone();

        // Children before parents, so foreign keys hold at every step.
        for adapter in adapters().into_iter().rev() {
            adapter.delete_all(&self.db).await?;
        }

        for kind in &manifest.entity_order {
            let section = match manifest.section(*kind) {
                Some(section) => section,
                None => continue,
            };
            let adapter = crate::catalog::adapter_for(*kind);
            for index in 0..section.chunk_count {
                let records = reader.read_chunk(*kind, index)?;
                adapter
                    .apply_chunk(&self.db, &records, ApplyPolicy::Overwrite)
                    .await?;
            }
        }

        for kind in &manifest.entity_order {
            let section = match manifest.section(*kind) {
                Some(section) => section,
                None => continue,
            };
            let count = crate::catalog::adapter_for(*kind).count(&self.db).await?;
            if count != section.count {
                return Err(MigrationError::Integrity(format!(
                    "restore count mismatch for {}: snapshot {} target {}",
                    kind, section.count, count
                )));
            }
        }

        self.invalidate(checkpoint_id).await?;
        info!(checkpoint_id, "checkpoint restored");
        Ok(())
    }

    /// Consume a checkpoint after a successful restore so a stale snapshot
    /// can never be replayed.
    pub async fn invalidate(&self, checkpoint_id: &str) -> Result<()> {
        let checkpoint = self.get(checkpoint_id).await?;
        let mut am = checkpoint.into_active_model();
        am.is_valid = Set(false);
        am.used_for_restore = Set(true);
        am.restored_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }
}
