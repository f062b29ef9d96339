//! Push and pull: the two directions of a backend-to-backend migration.
//!
//! Push exports locally and uploads the archive to the target instance,
//! which imports it as its own job. Pull asks the source instance for an
//! export, polls it to completion, downloads the archive and imports it
//! locally. Either way exactly one side performs the destructive apply.

use std::time::Duration;

use sea_orm::DatabaseConnection;
use tracing::info;

use crate::client::MigrationClient;
use crate::config::EngineConfig;
use crate::errors::{MigrationError, Result};
use crate::jobs::{JobRegistry, JobStatus, LogLevel, TargetLockMap};
use crate::services::export_service::{ExportOptions, ExportService};
use crate::services::import_service::{ImportOptions, ImportOutcome, ImportService};
use crate::services::transfer_service::{FileTransferService, TransferDirection};

#[derive(Clone)]
pub struct SyncService {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
    locks: TargetLockMap,
}

impl SyncService {
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

    /// Export locally, upload to the target, wait for the remote import.
    /// Returns the remote job id for the caller's records.
    pub async fn push(
        &self,
        job_id: &str,
        target_url: &str,
        token: &str,
        options: &ExportOptions,
    ) -> Result<String> {
        self.registry
            .set_urls(job_id, None, Some(target_url.to_string()))
            .await?;
        self.registry.transition(job_id, JobStatus::Validating).await?;
        let client = MigrationClient::new(target_url, token)?;

        self.registry.transition(job_id, JobStatus::Exporting).await?;
        let exporter =
            ExportService::new(self.db.clone(), self.config.clone(), self.registry.clone());
        let path = self.config.archive_dir.join(format!("push-{}.tar.gz", job_id));
        let summary = exporter.export_to_file(&path, options, Some(job_id)).await?;
        self.registry
            .set_archive(job_id, &path.to_string_lossy(), summary.archive_size_bytes as i64)
            .await?;

        self.registry.transition(job_id, JobStatus::Packaging).await?;
        self.registry
            .progress(job_id, 85, "uploading archive to target")
            .await?;
        let remote_job_id = client.upload_archive(&path).await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("target accepted archive as job {}", remote_job_id),
            )
            .await?;

        self.registry.transition(job_id, JobStatus::Verifying).await?;
        self.registry
            .progress(job_id, 90, "waiting for target import")
            .await?;
        self.wait_remote(&client, job_id, &remote_job_id).await?;

        self.registry.complete(job_id).await?;
        info!(job_id, remote_job_id = %remote_job_id, "push completed");
        Ok(remote_job_id)
    }

    /// Ask the source for an export, download it, import locally.
    pub async fn pull(
        &self,
        job_id: &str,
        source_url: &str,
        token: &str,
        export_options: &ExportOptions,
        import_options: &ImportOptions,
    ) -> Result<ImportOutcome> {
        self.registry
            .set_urls(job_id, Some(source_url.to_string()), None)
            .await?;
        self.registry.transition(job_id, JobStatus::Validating).await?;
        let client = MigrationClient::new(source_url, token)?;

        self.registry.transition(job_id, JobStatus::Downloading).await?;
        let remote_job_id = client.start_export(export_options).await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("source started export job {}", remote_job_id),
            )
            .await?;
        self.wait_remote_export(&client, job_id, &remote_job_id).await?;

        let path = self.config.archive_dir.join(format!("pull-{}.tar.gz", job_id));
        self.registry
            .progress(job_id, 15, "downloading archive")
            .await?;
        let bytes = client.download_export(&remote_job_id, &path).await?;
        self.registry
            .set_archive(job_id, &path.to_string_lossy(), bytes as i64)
            .await?;
        self.registry
            .log(
                job_id,
                LogLevel::Info,
                &format!("downloaded archive ({} bytes)", bytes),
            )
            .await?;

        let importer = ImportService::new(
            self.db.clone(),
            self.config.clone(),
            self.registry.clone(),
            self.locks.clone(),
        );
        // The import leaves the job in `verifying`; the media transfer
        // below still belongs to this job, so completion happens here.
        let mut outcome = importer
            .execute_deferring_completion(job_id, &path, import_options)
            .await?;
        if outcome.rolled_back {
            return Ok(outcome);
        }

        // When the source export carried no media bytes, fetch the files
        // over the transfer engine instead.
        if !export_options.include_media && !outcome.dry_run {
            let transfers = FileTransferService::new(
                client.clone(),
                self.config.clone(),
                self.registry.clone(),
            );
            let files = transfers.list_remote().await?;
            outcome.media_files = files.len() as u64;
            if let Err(err) = transfers
                .transfer_all(job_id, files, TransferDirection::Pull)
                .await
            {
                self.registry.fail(job_id, &err).await?;
                return Err(err);
            }
        }
        self.registry.complete(job_id).await?;
        info!(job_id, remote_job_id = %remote_job_id, "pull completed");
        Ok(outcome)
    }

    async fn wait_remote_export(
        &self,
        client: &MigrationClient,
        job_id: &str,
        remote_job_id: &str,
    ) -> Result<()> {
        loop {
            if self.registry.is_cancel_requested(job_id).await? {
                return Err(MigrationError::Cancelled(
                    "pull cancelled while waiting for source export".to_string(),
                ));
            }
            let remote = client.export_status(remote_job_id).await?;
            if remote.is_terminal() {
                if remote.status != "completed" {
                    return Err(MigrationError::TransferTerminal(format!(
                        "source export {}: {}",
                        remote.status,
                        remote.error_message.unwrap_or_default()
                    )));
                }
                return Ok(());
            }
            let percent = 5 + remote.progress_percent / 10;
            self.registry
                .progress(job_id, percent, "waiting for source export")
                .await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn wait_remote(
        &self,
        client: &MigrationClient,
        job_id: &str,
        remote_job_id: &str,
    ) -> Result<()> {
        loop {
            if self.registry.is_cancel_requested(job_id).await? {
                return Err(MigrationError::Cancelled(
                    "push cancelled while waiting for target import".to_string(),
                ));
            }
            let remote = client.remote_job(remote_job_id).await?;
            if remote.is_terminal() {
                if remote.status != "completed" {
                    return Err(MigrationError::TransferTerminal(format!(
                        "target import {}: {}",
                        remote.status,
                        remote.error_message.unwrap_or_default()
                    )));
                }
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}
