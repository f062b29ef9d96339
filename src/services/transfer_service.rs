//! File transfer engine: moves the media files declared in a manifest's
//! media index between instances.
//!
//! Transfers run in a bounded `buffer_unordered` pool. Transient failures
//! (timeout, connection reset, 5xx) are retried with exponential backoff up
//! to a fixed attempt bound; a checksum mismatch after a completed transfer
//! counts as transient once, then becomes terminal. Every completed file
//! bumps the owning job's counters so progress is observable mid-flight.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::archive::sha256_file;
use crate::client::{MigrationClient, RemoteMediaFile};
use crate::config::EngineConfig;
use crate::errors::{MigrationError, Result};
use crate::jobs::{JobRegistry, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Remote files are downloaded into the local media root.
    Pull,
    /// Local files are uploaded to the remote instance.
    Push,
}

#[derive(Clone)]
pub struct FileTransferService {
    client: MigrationClient,
    config: EngineConfig,
    registry: JobRegistry,
}

impl FileTransferService {
    pub fn new(client: MigrationClient, config: EngineConfig, registry: JobRegistry) -> Self {
        Self {
            client,
            config,
            registry,
        }
    }

    /// Remote media inventory.
    pub async fn list_remote(&self) -> Result<Vec<RemoteMediaFile>> {
        self.client.media_list().await
    }

    /// Transfer every file in the set, bounded by the configured pool
    /// width. Fails on the first file that exhausts its retries; files
    /// already in flight finish first.
    pub async fn transfer_all(
        &self,
        job_id: &str,
        files: Vec<RemoteMediaFile>,
        direction: TransferDirection,
    ) -> Result<u64> {
        self.registry
            .set_file_totals(job_id, files.len() as i64)
            .await?;
        let mut transferred: u64 = 0;
        let mut pool = stream::iter(files.into_iter().map(|file| {
            let service = self.clone();
            let job_id = job_id.to_string();
            async move { service.transfer_one(&job_id, &file, direction).await }
        }))
        .buffer_unordered(self.config.parallel_transfers);

        while let Some(result) = pool.next().await {
            let bytes = result?;
            transferred += bytes;
        }
        Ok(transferred)
    }

    /// One file with the full retry policy.
    pub async fn transfer_one(
        &self,
        job_id: &str,
        file: &RemoteMediaFile,
        direction: TransferDirection,
    ) -> Result<u64> {
        if self.registry.is_cancel_requested(job_id).await? {
            return Err(MigrationError::Cancelled(
                "transfer cancelled between files".to_string(),
            ));
        }

        let mut checksum_retried = false;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(file, direction).await {
                Ok(bytes) => {
                    self.registry.add_file(job_id, bytes as i64).await?;
                    debug!(path = %file.path, bytes, attempt, "file transferred");
                    return Ok(bytes);
                }
                Err(err @ MigrationError::Integrity(_)) if !checksum_retried => {
                    // One free retry for a corrupted-in-flight file.
                    checksum_retried = true;
                    warn!(path = %file.path, "checksum mismatch, retrying once");
                    self.registry
                        .log(
                            job_id,
                            LogLevel::Warn,
                            &format!("checksum mismatch for {}, retrying: {}", file.path, err),
                        )
                        .await?;
                }
                Err(MigrationError::Integrity(detail)) => {
                    return Err(MigrationError::TransferTerminal(format!(
                        "checksum mismatch persisted for {}: {}",
                        file.path, detail
                    )));
                }
                Err(err) if err.is_transient() && attempt < self.config.max_transfer_attempts => {
                    let backoff = Duration::from_millis(
                        self.config.retry_base_ms * 2u64.pow(attempt - 1),
                    );
                    warn!(
                        path = %file.path,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient transfer failure, backing off"
                    );
                    self.registry
                        .log(
                            job_id,
                            LogLevel::Warn,
                            &format!(
                                "retrying {} after transient failure (attempt {}): {}",
                                file.path, attempt, err
                            ),
                        )
                        .await?;
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    self.registry
                        .log(
                            job_id,
                            LogLevel::Error,
                            &format!(
                                "transfer failed for {} after {} attempts: {}",
                                file.path, attempt, err
                            ),
                        )
                        .await?;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        file: &RemoteMediaFile,
        direction: TransferDirection,
    ) -> Result<u64> {
        let local: PathBuf = self.config.media_root.join(&file.path);
        match direction {
            TransferDirection::Pull => {
                let bytes = self.client.download_file(&file.path, &local).await?;
                let checksum = sha256_file(&local)?;
                if checksum != file.checksum {
                    return Err(MigrationError::Integrity(format!(
                        "expected {} got {}",
                        file.checksum, checksum
                    )));
                }
                Ok(bytes)
            }
            TransferDirection::Push => {
                if !local.is_file() {
                    return Err(MigrationError::TransferTerminal(format!(
                        "local file missing: {}",
                        file.path
                    )));
                }
                let checksum = sha256_file(&local)?;
                if checksum != file.checksum {
                    return Err(MigrationError::Integrity(format!(
                        "expected {} got {}",
                        file.checksum, checksum
                    )));
                }
                self.client
                    .upload_file(&file.path, &local, &checksum)
                    .await?;
                Ok(file.size_bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base: u64 = 500;
        let delays: Vec<u64> = (1..=3u32).map(|a| base * 2u64.pow(a - 1)).collect();
        assert_eq!(delays, vec![500, 1000, 2000]);
    }
}
