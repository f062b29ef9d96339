//! HTTP client for a remote gangway instance, used by the push and pull
//! directions and by the file transfer engine.
//!
//! Every call carries the migration token in the dedicated scheme
//! (`Authorization: MigrationToken <value>`), distinct from any user
//! authentication the remote platform may have.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::{MigrationError, Result};
use crate::services::export_service::ExportOptions;

pub const AUTH_SCHEME: &str = "MigrationToken";

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJob {
    pub id: String,
    pub status: String,
    pub progress_percent: i32,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub archive_size_bytes: Option<i64>,
}

impl RemoteJob {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "rolled_back")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMediaFile {
    pub path: String,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Clone)]
pub struct MigrationClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl MigrationClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| MigrationError::FatalSystem(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/migration{}", self.base_url, path)
    }

    fn auth_value(&self) -> String {
        format!("{} {}", AUTH_SCHEME, self.token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                MigrationError::Authentication(format!("remote rejected token: {}", detail))
            }
            StatusCode::NOT_FOUND => {
                MigrationError::TransferTerminal(format!("remote resource missing: {}", detail))
            }
            StatusCode::CONFLICT => MigrationError::Conflict(detail),
            s if s.is_server_error() => {
                MigrationError::TransferTransient(format!("remote error {}: {}", s, detail))
            }
            s => MigrationError::TransferTerminal(format!("remote error {}: {}", s, detail)),
        })
    }

    pub async fn start_export(&self, options: &ExportOptions) -> Result<String> {
        let response = self
            .http
            .post(self.url("/export"))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .json(options)
            .send()
            .await?;
        let accepted: JobAccepted = Self::check(response).await?.json().await?;
        Ok(accepted.job_id)
    }

    pub async fn export_status(&self, job_id: &str) -> Result<RemoteJob> {
        let response = self
            .http
            .get(self.url(&format!("/export-status/{}", job_id)))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Poll until the remote job reaches a terminal state.
    pub async fn wait_for_export(&self, job_id: &str) -> Result<RemoteJob> {
        loop {
            let job = self.export_status(job_id).await?;
            if job.is_terminal() {
                if job.status != "completed" {
                    return Err(MigrationError::TransferTerminal(format!(
                        "remote export {}: {}",
                        job.status,
                        job.error_message.unwrap_or_default()
                    )));
                }
                return Ok(job);
            }
            debug!(
                job_id,
                status = %job.status,
                progress = job.progress_percent,
                "remote export in progress"
            );
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    pub async fn download_export(&self, job_id: &str, dest: &Path) -> Result<u64> {
        let response = self
            .http
            .get(self.url(&format!("/download-export/{}", job_id)))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .send()
            .await?;
        self.stream_to_file(Self::check(response).await?, dest).await
    }

    pub async fn upload_archive(&self, archive: &Path) -> Result<String> {
        let bytes = tokio::fs::read(archive).await?;
        let response = self
            .http
            .post(self.url("/receive-import"))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let accepted: JobAccepted = Self::check(response).await?.json().await?;
        Ok(accepted.job_id)
    }

    pub async fn remote_job(&self, job_id: &str) -> Result<RemoteJob> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}", job_id)))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Poll any remote job (import, restore) to a terminal state.
    pub async fn wait_for_job(&self, job_id: &str) -> Result<RemoteJob> {
        loop {
            let job = self.remote_job(job_id).await?;
            if job.is_terminal() {
                if job.status != "completed" {
                    return Err(MigrationError::TransferTerminal(format!(
                        "remote job {}: {}",
                        job.status,
                        job.error_message.unwrap_or_default()
                    )));
                }
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    pub async fn media_list(&self) -> Result<Vec<RemoteMediaFile>> {
        let response = self
            .http
            .get(self.url("/media-list"))
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn download_file(&self, remote_path: &str, dest: &Path) -> Result<u64> {
        let response = self
            .http
            .get(self.url("/download-file"))
            .query(&[("path", remote_path)])
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .send()
            .await?;
        self.stream_to_file(Self::check(response).await?, dest).await
    }

    pub async fn upload_file(
        &self,
        remote_path: &str,
        source: &Path,
        checksum: &str,
    ) -> Result<()> {
        let bytes = tokio::fs::read(source).await?;
        let response = self
            .http
            .post(self.url("/receive-file"))
            .query(&[("path", remote_path), ("checksum", checksum)])
            .header(reqwest::header::AUTHORIZATION, self.auth_value())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn stream_to_file(&self, response: reqwest::Response, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}
