//! Export engine: streams platform entities into a migration archive.
//!
//! Entities are written in catalog dependency order, in bounded chunks, with
//! a running per-kind checksum. The manifest goes in last, so an aborted
//! export can never look complete. Any read error aborts the whole export.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::archive::{ArchiveReader, ArchiveWriter, EntitySection, Manifest};
use crate::catalog::{adapters, EntityKind};
use crate::config::EngineConfig;
use crate::database::entities::media_assets;
use crate::errors::{MigrationError, Result};
use crate::jobs::{JobRegistry, JobStatus, LogLevel};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Restrict the export to these kinds (plus nothing else). Empty means
    /// every kind.
    #[serde(default)]
    pub include: Vec<EntityKind>,
    #[serde(default)]
    pub exclude: Vec<EntityKind>,
    #[serde(default)]
    pub changed_since: Option<DateTime<Utc>>,
    #[serde(default = "default_include_media")]
    pub include_media: bool,
}

fn default_include_media() -> bool {
    true
}

impl ExportOptions {
    pub fn selected_kinds(&self) -> Result<Vec<EntityKind>> {
        let include: HashSet<EntityKind> = self.include.iter().copied().collect();
        let exclude: HashSet<EntityKind> = self.exclude.iter().copied().collect();
        if let Some(kind) = include.intersection(&exclude).next() {
            return Err(MigrationError::Validation(format!(
                "entity kind both included and excluded: {}",
                kind
            )));
        }
        Ok(EntityKind::dependency_order()
            .iter()
            .copied()
            .filter(|k| include.is_empty() || include.contains(k))
            .filter(|k| !exclude.contains(k))
            .collect())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
    pub archive_path: PathBuf,
    pub archive_size_bytes: u64,
    pub records: u64,
    pub media_files: u64,
    pub media_bytes: u64,
}

#[derive(Clone)]
pub struct ExportService {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
}

impl ExportService {
    pub fn new(db: DatabaseConnection, config: EngineConfig, registry: JobRegistry) -> Self {
        Self {
            db,
            config,
            registry,
        }
    }

    /// Run a full export as the given job, leaving it `completed` on
    /// success. The caller owns failure handling via `JobRegistry::fail`.
    pub async fn run(&self, job_id: &str, options: &ExportOptions) -> Result<ExportSummary> {
        self.registry.transition(job_id, JobStatus::Validating).await?;
        let kinds = options.selected_kinds()?;
        if kinds.is_empty() {
            return Err(MigrationError::Validation(
                "export selects no entity kinds".to_string(),
            ));
        }
        self.registry.transition(job_id, JobStatus::Exporting).await?;
        let path = self.config.archive_dir.join(format!("export-{}.tar.gz", job_id));

        let summary = self
            .export_to_file(&path, options, Some(job_id))
            .await?;

        self.registry
            .set_archive(job_id, &path.to_string_lossy(), summary.archive_size_bytes as i64)
            .await?;

        // Re-open what we just wrote as a self-check before declaring success.
        self.registry.transition(job_id, JobStatus::Verifying).await?;
        let reader = ArchiveReader::open(&path)?;
        reader.validate()?;
        self.registry.complete(job_id).await?;
        info!(job_id, records = summary.records, "export completed");
        Ok(summary)
    }

    /// Core archive writer, also used by the checkpoint store (no job) and
    /// the CLI.
    pub async fn export_to_file(
        &self,
        path: &Path,
        options: &ExportOptions,
        job_id: Option<&str>,
    ) -> Result<ExportSummary> {
        let kinds = options.selected_kinds()?;
        let mut writer = ArchiveWriter::create(path)?;
        let mut manifest = Manifest::new(&self.config.environment);
        manifest.entity_order = kinds.clone();
        let mut summary = ExportSummary {
            archive_path: path.to_path_buf(),
            ..Default::default()
        };

        if let Some(job_id) = job_id {
            self.registry
                .set_entity_totals(job_id, kinds.len() as i32, 0)
                .await?;
        }

        for (index, adapter) in adapters()
            .into_iter()
            .filter(|a| kinds.contains(&a.kind()))
            .enumerate()
        {
            let kind = adapter.kind();
            let started = Instant::now();
            let mut hasher = Sha256::new();
            let mut records: u64 = 0;
            let mut chunk_count: u64 = 0;

            loop {
                if let Some(job_id) = job_id {
                    if self.registry.is_cancel_requested(job_id).await? {
                        return Err(MigrationError::Cancelled(
                            "export cancelled between chunks".to_string(),
                        ));
                    }
                }
                let chunk = adapter
                    .fetch_chunk(
                        &self.db,
                        chunk_count,
                        self.config.chunk_size,
                        options.changed_since,
                    )
                    .await?;
                if chunk.is_empty() && chunk_count > 0 {
                    break;
                }
                let bytes = writer.append_chunk(kind, chunk_count, &chunk)?;
                hasher.update(&bytes);
                records += chunk.len() as u64;
                chunk_count += 1;
                if (chunk.len() as u64) < self.config.chunk_size {
                    break;
                }
            }

            manifest.entities.insert(
                kind.as_str().to_string(),
                EntitySection {
                    count: records,
                    chunk_count,
                    checksum: hex::encode(hasher.finalize()),
                },
            );
            summary.records += records;

            if let Some(job_id) = job_id {
                let percent = (80 * (index + 1) / kinds.len()) as i32;
                self.registry
                    .progress(job_id, percent, &format!("exported {}", kind))
                    .await?;
                self.registry.entity_completed(job_id).await?;
                self.registry.add_records(job_id, records as i64, 0).await?;
                self.registry
                    .log_entity(
                        job_id,
                        LogLevel::Info,
                        &format!("exported {} {} records", records, kind),
                        Some(kind),
                        Some(records as i64),
                        Some(started.elapsed().as_millis() as i64),
                    )
                    .await?;
            }
        }

        if options.include_media && kinds.contains(&EntityKind::MediaAssets) {
            self.embed_media(&mut writer, &mut manifest, &mut summary, job_id)
                .await?;
            if let Some(job_id) = job_id {
                self.registry.progress(job_id, 95, "embedded media").await?;
            }
        }

        summary.archive_size_bytes = writer.finish(&manifest)?;
        if let Some(job_id) = job_id {
            self.registry.progress(job_id, 100, "manifest written").await?;
        }
        Ok(summary)
    }

    async fn embed_media(
        &self,
        writer: &mut ArchiveWriter,
        manifest: &mut Manifest,
        summary: &mut ExportSummary,
        job_id: Option<&str>,
    ) -> Result<()> {
        let assets = media_assets::Entity::find().all(&self.db).await?;
        if let Some(job_id) = job_id {
            self.registry
                .set_file_totals(job_id, assets.len() as i64)
                .await?;
        }
        for asset in assets {
            if let Some(job_id) = job_id {
                if self.registry.is_cancel_requested(job_id).await? {
                    return Err(MigrationError::Cancelled(
                        "export cancelled between files".to_string(),
                    ));
                }
            }
            let source = self.config.media_root.join(&asset.file_path);
            if !source.is_file() {
                return Err(MigrationError::Validation(format!(
                    "media asset missing on disk: {}",
                    asset.file_path
                )));
            }
            let entry = writer.append_media_file(&asset.file_path, &source)?;
            summary.media_files += 1;
            summary.media_bytes += entry.size_bytes;
            if let Some(job_id) = job_id {
                self.registry.add_file(job_id, entry.size_bytes as i64).await?;
            }
            manifest.media_index.insert(asset.file_path, entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_select_every_kind_in_order() {
        let options = ExportOptions::default();
        assert_eq!(
            options.selected_kinds().unwrap().as_slice(),
            EntityKind::dependency_order()
        );
    }

    #[test]
    fn exclude_filters_the_full_set() {
        let options = ExportOptions {
            exclude: vec![EntityKind::Orders, EntityKind::Tickets],
            ..Default::default()
        };
        assert_eq!(
            options.selected_kinds().unwrap(),
            vec![
                EntityKind::Users,
                EntityKind::Organizers,
                EntityKind::Venues,
                EntityKind::Events,
                EntityKind::TicketTiers,
                EntityKind::MediaAssets,
            ]
        );
    }

    #[test]
    fn overlapping_include_exclude_is_rejected() {
        let options = ExportOptions {
            include: vec![EntityKind::Users],
            exclude: vec![EntityKind::Users],
            ..Default::default()
        };
        assert!(options.selected_kinds().is_err());
    }

    #[test]
    fn selection_preserves_dependency_order() {
        let options = ExportOptions {
            include: vec![EntityKind::Tickets, EntityKind::Users, EntityKind::Orders],
            ..Default::default()
        };
        assert_eq!(
            options.selected_kinds().unwrap(),
            vec![EntityKind::Users, EntityKind::Orders, EntityKind::Tickets]
        );
    }
}
