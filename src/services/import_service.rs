//! Import engine: validate, checkpoint, apply, verify, finalize.
//!
//! Nothing is mutated until the archive has passed full structural
//! validation, and when checkpointing is enabled nothing is mutated until
//! the checkpoint is durable and valid. Entities are applied strictly in
//! the manifest's dependency order, never in tar entry order. On an apply
//! or verify failure the engine rolls back automatically when a valid
//! checkpoint exists and policy allows.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::{sha256_file, ArchiveReader};
use crate::catalog::{adapter_for, ApplyPolicy, ApplyStats};
use crate::config::EngineConfig;
use crate::errors::{MigrationError, Result};
use crate::jobs::{JobRegistry, JobStatus, LogLevel, TargetLockMap};
use crate::services::checkpoint_service::CheckpointService;
use crate::services::integrity_service::IntegrityService;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub policy: ApplyPolicy,
    pub verify: bool,
    pub create_checkpoint: bool,
    pub dry_run: bool,
    /// When true, a failing entity kind is logged and the apply phase moves
    /// on to the next kind; the job still fails at the end.
    pub continue_on_error: bool,
    pub auto_rollback: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            policy: ApplyPolicy::Merge,
            verify: true,
            create_checkpoint: true,
            dry_run: false,
            continue_on_error: false,
            auto_rollback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportOutcome {
    pub stats: ApplyStats,
    pub media_files: u64,
    pub dry_run: bool,
    pub rolled_back: bool,
}

#[derive(Clone)]
pub struct ImportService {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
    locks: TargetLockMap,
}

impl ImportService {
    pub fn new(
        db: DatabaseConnection,
        config: EngineConfig,
        registry: JobRegistry,
        locks: TargetLockMap,
    ) -> Self {
        Self {
            db,
            config,
            registry,
            locks,
        }
    }

    /// Run an import as the given job, including failure handling and
    /// automatic rollback. Always leaves the job in a terminal state.
    pub async fn execute(
        &self,
        job_id: &str,
        archive_path: &Path,
        options: &ImportOptions,
    ) -> Result<ImportOutcome> {
        self.execute_inner(job_id, archive_path, options, true).await
    }

    /// Same engine, but a successful import leaves the job live in
    /// `verifying`. For callers with more work to do under the same job
    /// (the pull path transfers media afterwards); they complete the job
    /// themselves. Failures still leave the job terminal.
    pub async fn execute_deferring_completion(
        &self,
        job_id: &str,
        archive_path: &Path,
        options: &ImportOptions,
    ) -> Result<ImportOutcome> {
        self.execute_inner(job_id, archive_path, options, false).await
    }

    async fn execute_inner(
        &self,
        job_id: &str,
        archive_path: &Path,
        options: &ImportOptions,
        finalize: bool,
    ) -> Result<ImportOutcome> {
        // Destructive operations against one target are never concurrent.
        // The lock key is this instance's own environment name; a second
        // import or restore is rejected up front, not queued.
        let _lock = match self.locks.acquire(&self.config.environment) {
            Ok(lock) => lock,
            Err(err) => {
                self.registry.fail(job_id, &err).await?;
                return Err(err);
            }
        };

        match self.run(job_id, archive_path, options, finalize).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.registry.fail(job_id, &err).await?;
                if self.should_roll_back(job_id, &err, options).await? {
                    let rolled = self.roll_back(job_id).await;
                    match rolled {
                        Ok(()) => {
                            return Ok(ImportOutcome {
                                rolled_back: true,
                                ..Default::default()
                            })
                        }
                        Err(rollback_err) => {
                            self.registry
                                .log(
                                    job_id,
                                    LogLevel::Error,
                                    &format!("automatic rollback failed: {}", rollback_err),
                                )
                                .await?;
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        job_id: &str,
        archive_path: &Path,
        options: &ImportOptions,
        finalize: bool,
    ) -> Result<ImportOutcome> {
        // A pull job arrives here already in `downloading`; a plain import
        // starts from `created`.
        let current: JobStatus = self.registry.get(job_id).await?.status.parse()?;
        if current == JobStatus::Created {
            self.registry.transition(job_id, JobStatus::Validating).await?;
        }
        self.registry.progress(job_id, 5, "validating archive").await?;
        let reader = ArchiveReader::open(archive_path)?;
        reader.validate()?;
        let manifest = reader.manifest().clone();
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!(
                    "archive valid: {} records from {}",
                    manifest.total_records(),
                    manifest.source_environment
                ),
            )
            .await?;
        self.registry
            .set_entity_totals(
                job_id,
                manifest.entities.len() as i32,
                manifest.total_records() as i64,
            )
            .await?;

        if options.dry_run {
            for kind in &manifest.entity_order {
                if let Some(section) = manifest.section(*kind) {
                    self.registry
                        .log_entity(
                            job_id,
                            LogLevel::Info,
                            &format!("dry run: would apply {} {} records", section.count, kind),
                            Some(*kind),
                            Some(section.count as i64),
                            None,
                        )
                        .await?;
                }
            }
            self.registry.transition(job_id, JobStatus::Verifying).await?;
            if finalize {
                self.registry.complete(job_id).await?;
            }
            return Ok(ImportOutcome {
                dry_run: true,
                ..Default::default()
            });
        }

        if options.create_checkpoint {
            self.registry
                .transition(job_id, JobStatus::Checkpointing)
                .await?;
            self.registry
                .progress(job_id, 15, "creating checkpoint")
                .await?;
            let checkpoints =
                CheckpointService::new(self.db.clone(), self.config.clone(), self.registry.clone());
            let checkpoint = checkpoints
                .create(&format!("pre-import for job {}", job_id))
                .await?;
            self.registry.set_checkpoint(job_id, &checkpoint.id).await?;
            self.registry
                .log(
                    job_id,
                    LogLevel::Info,
                    &format!(
                        "checkpoint {} valid ({} records)",
                        checkpoint.id, checkpoint.total_records
                    ),
                )
                .await?;
        } else {
            self.registry
                .log(
                    job_id,
                    LogLevel::Warn,
                    "checkpoint skipped by request; rollback will not be possible",
                )
                .await?;
        }

        self.registry.transition(job_id, JobStatus::Applying).await?;
        let mut outcome = ImportOutcome::default();
        let mut kind_failures: Vec<MigrationError> = Vec::new();
        let total_kinds = manifest.entities.len().max(1);

        for (index, kind) in manifest.entity_order.iter().enumerate() {
            let section = match manifest.section(*kind) {
                Some(section) => section,
                None => continue,
            };
            let started = Instant::now();
            let mut stats = ApplyStats::default();
            let adapter = adapter_for(*kind);
            let mut failed = None;

            for chunk_index in 0..section.chunk_count {
                if self.registry.is_cancel_requested(job_id).await? {
                    return Err(MigrationError::Cancelled(
                        "import cancelled between chunks".to_string(),
                    ));
                }
                let records = reader.read_chunk(*kind, chunk_index)?;
                match adapter
                    .apply_chunk(&self.db, &records, options.policy)
                    .await
                {
                    Ok(chunk_stats) => {
                        stats.absorb(chunk_stats);
                        self.registry
                            .add_records(
                                job_id,
                                chunk_stats.processed() as i64,
                                chunk_stats.skipped as i64,
                            )
                            .await?;
                    }
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
            }

            match failed {
                None => {
                    outcome.stats.absorb(stats);
                    self.registry.entity_completed(job_id).await?;
                    self.registry
                        .log_entity(
                            job_id,
                            LogLevel::Info,
                            &format!(
                                "applied {}: {} inserted, {} updated, {} skipped",
                                kind, stats.inserted, stats.updated, stats.skipped
                            ),
                            Some(*kind),
                            Some((stats.processed() + stats.skipped) as i64),
                            Some(started.elapsed().as_millis() as i64),
                        )
                        .await?;
                }
                Some(err) => {
                    self.registry
                        .log_entity(
                            job_id,
                            LogLevel::Error,
                            &format!("apply failed for {}: {}", kind, err),
                            Some(*kind),
                            None,
                            Some(started.elapsed().as_millis() as i64),
                        )
                        .await?;
                    if !options.continue_on_error {
                        return Err(err);
                    }
                    kind_failures.push(err);
                }
            }

            let percent = 20 + (60 * (index + 1) / total_kinds) as i32;
            self.registry
                .progress(job_id, percent, &format!("applied {}", kind))
                .await?;
        }

        outcome.media_files = self.extract_media(job_id, &reader).await?;

        if let Some(first) = kind_failures.into_iter().next() {
            return Err(first);
        }

        if options.verify {
            self.registry.transition(job_id, JobStatus::Verifying).await?;
            self.registry.progress(job_id, 90, "verifying counts").await?;
            let integrity = IntegrityService::new(self.db.clone());
            integrity.verify_against_manifest(&manifest).await?;
            self.registry
                .log(job_id, LogLevel::Info, "post-import verification passed")
                .await?;
        } else {
            self.registry.transition(job_id, JobStatus::Verifying).await?;
            self.registry
                .log(job_id, LogLevel::Warn, "verification skipped by request")
                .await?;
        }

        if finalize {
            self.registry.complete(job_id).await?;
        }
        info!(
            job_id,
            inserted = outcome.stats.inserted,
            updated = outcome.stats.updated,
            skipped = outcome.stats.skipped,
            "import completed"
        );
        Ok(outcome)
    }

    /// Copy media bytes embedded in the archive into the media root.
    /// Existing files with a matching checksum are left alone.
    async fn extract_media(&self, job_id: &str, reader: &ArchiveReader) -> Result<u64> {
        let manifest = reader.manifest();
        if manifest.media_index.is_empty() {
            return Ok(0);
        }
        self.registry
            .set_file_totals(job_id, manifest.media_index.len() as i64)
            .await?;
        let mut copied = 0;
        for (relative, entry) in &manifest.media_index {
            if self.registry.is_cancel_requested(job_id).await? {
                return Err(MigrationError::Cancelled(
                    "import cancelled between files".to_string(),
                ));
            }
            let target = safe_media_target(&self.config.media_root, relative)?;
            if target.is_file() && sha256_file(&target)? == entry.checksum {
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(reader.media_path(relative), &target)?;
            let checksum = sha256_file(&target)?;
            if checksum != entry.checksum {
                return Err(MigrationError::Integrity(format!(
                    "media checksum mismatch after copy: {}",
                    relative
                )));
            }
            copied += 1;
            self.registry.add_file(job_id, entry.size_bytes as i64).await?;
        }
        if copied > 0 {
            self.registry
                .log(
                    job_id,
                    LogLevel::Info,
                    &format!("extracted {} media files", copied),
                )
                .await?;
        }
        Ok(copied)
    }

    async fn should_roll_back(
        &self,
        job_id: &str,
        err: &MigrationError,
        options: &ImportOptions,
    ) -> Result<bool> {
        if !options.auto_rollback || !options.create_checkpoint {
            return Ok(false);
        }
        // Validation and authentication failures happen before any
        // mutation; there is nothing to undo.
        if matches!(
            err,
            MigrationError::Validation(_) | MigrationError::Authentication(_)
        ) {
            return Ok(false);
        }
        let job = self.registry.get(job_id).await?;
        Ok(job.checkpoint_id.is_some())
    }

    /// Restore the job's checkpoint and mark the job rolled back.
    /// Also the path behind `POST /rollback/{job_id}`.
    pub async fn roll_back(&self, job_id: &str) -> Result<()> {
        let job = self.registry.get(job_id).await?;
        let checkpoint_id = job.checkpoint_id.clone().ok_or_else(|| {
            MigrationError::Validation(format!("job {} has no checkpoint", job_id))
        })?;
        let status: JobStatus = job.status.parse()?;
        if status != JobStatus::Failed {
            return Err(MigrationError::Conflict(format!(
                "job {} is {}, only failed jobs roll back",
                job_id, status
            )));
        }
        let checkpoints =
            CheckpointService::new(self.db.clone(), self.config.clone(), self.registry.clone());
        checkpoints.restore(&checkpoint_id).await?;
        self.registry
            .transition(job_id, JobStatus::RolledBack)
            .await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("rolled back to checkpoint {}", checkpoint_id),
            )
            .await?;
        warn!(job_id, checkpoint_id = %checkpoint_id, "job rolled back");
        Ok(())
    }
}

/// Join a relative media path under the root, refusing traversal.
fn safe_media_target(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(MigrationError::Validation(format!(
            "unsafe media path: {}",
            relative
        )));
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_checkpoint_verify_and_merge() {
        let options = ImportOptions::default();
        assert_eq!(options.policy, ApplyPolicy::Merge);
        assert!(options.verify);
        assert!(options.create_checkpoint);
        assert!(options.auto_rollback);
        assert!(!options.dry_run);
        assert!(!options.continue_on_error);
    }

    #[test]
    fn media_paths_cannot_escape_the_root() {
        let root = Path::new("/var/lib/gangway/media");
        assert!(safe_media_target(root, "events/banner.png").is_ok());
        assert!(safe_media_target(root, "../outside.png").is_err());
        assert!(safe_media_target(root, "a/../../outside.png").is_err());
        assert!(safe_media_target(root, "/etc/passwd").is_err());
    }
}
