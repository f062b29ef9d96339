//! Backup/restore orchestrator: disaster recovery from an externally
//! produced bundle rather than a same-schema export.
//!
//! Phases, each updating the job's step and coarse progress: validate the
//! bundle (10), safety backup (25), pause the service gate (30), replace
//! the database from the snapshot (70), resume the gate (75), restore the
//! media tree (90), final verification (100). The gate is resumed on every
//! path out of the destructive window.

pub mod bundle;
pub mod database_restore;
pub mod media_restore;

use std::path::Path;

use sea_orm::DatabaseConnection;
use tracing::info;

use crate::config::EngineConfig;
use crate::errors::{MigrationError, Result};
use crate::jobs::{JobRegistry, JobStatus, LogLevel, ServiceGate, TargetLockMap};
use crate::services::integrity_service::IntegrityService;

use bundle::RestoreBundle;

#[derive(Clone)]
pub struct RestoreOrchestrator {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
    gate: ServiceGate,
    locks: TargetLockMap,
}

impl RestoreOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        config: EngineConfig,
        registry: JobRegistry,
        gate: ServiceGate,
        locks: TargetLockMap,
    ) -> Self {
        Self {
            db,
            config,
            registry,
            gate,
            locks,
        }
    }

    /// Run the full restore as the given job, leaving it terminal either
    /// way.
    pub async fn execute(&self, job_id: &str, bundle_path: &Path) -> Result<()> {
        let _lock = match self.locks.acquire(&self.config.environment) {
            Ok(lock) => lock,
            Err(err) => {
                self.registry.fail(job_id, &err).await?;
                return Err(err);
            }
        };
        match self.run(job_id, bundle_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.registry.fail(job_id, &err).await?;
                Err(err)
            }
        }
    }

    async fn run(&self, job_id: &str, bundle_path: &Path) -> Result<()> {
        self.registry.transition(job_id, JobStatus::Validating).await?;
        self.registry.progress(job_id, 10, "validating bundle").await?;
        let bundle = RestoreBundle::open(bundle_path)?;
        self.registry
            .log(job_id, LogLevel::Info, "bundle structure valid")
            .await?;

        self.registry
            .transition(job_id, JobStatus::Checkpointing)
            .await?;
        self.registry.progress(job_id, 25, "safety backup").await?;
        let backup_path =
            database_restore::safety_backup(&self.db, &self.config.checkpoint_dir).await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("safety backup at {}", backup_path.display()),
            )
            .await?;

        self.registry.transition(job_id, JobStatus::Restoring).await?;
        self.registry.progress(job_id, 30, "pausing service").await?;
        let admins = database_restore::snapshot_admins(&self.db).await?;
        self.gate.pause();
        let destructive = database_restore::restore_database(&self.db, &bundle.database_snapshot())
            .await;
        self.gate.resume();
        let counts = destructive?;
        self.registry
            .progress(job_id, 70, "database restored")
            .await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("database restored: {} rows", counts.total()),
            )
            .await?;
        self.registry.progress(job_id, 75, "service resumed").await?;

        let reinstated = database_restore::reinstate_admins(&self.db, &admins).await?;
        if reinstated > 0 {
            self.registry
                .log(
                    job_id,
                    LogLevel::Info,
                    &format!("reinstated {} local admin accounts", reinstated),
                )
                .await?;
        }

        let copied = media_restore::restore_media(&bundle.media_root(), &self.config.media_root)?;
        self.registry.progress(job_id, 90, "media restored").await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("restored {} media files", copied),
            )
            .await?;

        self.registry.transition(job_id, JobStatus::Verifying).await?;
        let report = IntegrityService::new(self.db.clone()).verify().await?;
        if !report.is_clean() {
            return Err(MigrationError::Integrity(format!(
                "restore left {} orphaned foreign keys (first: {})",
                report.orphans.len(),
                report.orphans[0]
            )));
        }
        self.registry.complete(job_id).await?;
        info!(job_id, rows = counts.total(), media = copied, "restore completed");
        Ok(())
    }
}
