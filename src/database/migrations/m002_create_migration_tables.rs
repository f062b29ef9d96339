use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create migration_checkpoints table (referenced by migration_jobs)
        manager
            .create_table(
                Table::create()
                    .table(MigrationCheckpoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MigrationCheckpoints::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MigrationCheckpoints::Name).string().not_null())
                    .col(ColumnDef::new(MigrationCheckpoints::SnapshotPath).string().not_null())
                    .col(ColumnDef::new(MigrationCheckpoints::SizeBytes).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationCheckpoints::TotalRecords).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationCheckpoints::IsValid).boolean().not_null().default(false))
                    .col(ColumnDef::new(MigrationCheckpoints::UsedForRestore).boolean().not_null().default(false))
                    .col(ColumnDef::new(MigrationCheckpoints::RestoredAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationCheckpoints::ExpiresAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationCheckpoints::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // Create migration_jobs table
        manager
            .create_table(
                Table::create()
                    .table(MigrationJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MigrationJobs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MigrationJobs::Kind).string().not_null())
                    .col(ColumnDef::new(MigrationJobs::Status).string().not_null())
                    .col(ColumnDef::new(MigrationJobs::ProgressPercent).integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::CurrentStep).string().not_null().default(""))
                    .col(ColumnDef::new(MigrationJobs::CreatedBy).string())
                    .col(ColumnDef::new(MigrationJobs::SourceUrl).string())
                    .col(ColumnDef::new(MigrationJobs::TargetUrl).string())
                    .col(ColumnDef::new(MigrationJobs::ArchivePath).string())
                    .col(ColumnDef::new(MigrationJobs::ArchiveSizeBytes).big_integer())
                    .col(ColumnDef::new(MigrationJobs::TotalEntities).integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::EntitiesCompleted).integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::RecordsTotal).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::RecordsProcessed).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::RecordsSkipped).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::FilesTotal).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::FilesProcessed).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::BytesTransferred).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationJobs::StartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationJobs::CompletedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationJobs::DurationSeconds).big_integer())
                    .col(ColumnDef::new(MigrationJobs::LastProgressAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationJobs::ErrorMessage).text())
                    .col(ColumnDef::new(MigrationJobs::ErrorDetail).text())
                    .col(ColumnDef::new(MigrationJobs::CheckpointId).string())
                    .col(ColumnDef::new(MigrationJobs::CancelRequested).boolean().not_null().default(false))
                    .col(ColumnDef::new(MigrationJobs::CreatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-migration_jobs-checkpoint_id")
                            .from(MigrationJobs::Table, MigrationJobs::CheckpointId)
                            .to(MigrationCheckpoints::Table, MigrationCheckpoints::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create migration_logs table
        manager
            .create_table(
                Table::create()
                    .table(MigrationLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MigrationLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MigrationLogs::JobId).string().not_null())
                    .col(ColumnDef::new(MigrationLogs::Seq).big_integer().not_null())
                    .col(ColumnDef::new(MigrationLogs::Timestamp).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MigrationLogs::Level).string().not_null())
                    .col(ColumnDef::new(MigrationLogs::Message).text().not_null())
                    .col(ColumnDef::new(MigrationLogs::EntityKind).string())
                    .col(ColumnDef::new(MigrationLogs::RecordCount).big_integer())
                    .col(ColumnDef::new(MigrationLogs::DurationMs).big_integer())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-migration_logs-job_id")
                            .from(MigrationLogs::Table, MigrationLogs::JobId)
                            .to(MigrationJobs::Table, MigrationJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create migration_tokens table
        manager
            .create_table(
                Table::create()
                    .table(MigrationTokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MigrationTokens::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MigrationTokens::TokenHash).string().not_null().unique_key())
                    .col(ColumnDef::new(MigrationTokens::Description).string().not_null())
                    .col(ColumnDef::new(MigrationTokens::Permission).string().not_null())
                    .col(ColumnDef::new(MigrationTokens::AllowedIps).text().not_null().default("[]"))
                    .col(ColumnDef::new(MigrationTokens::AllowedDomains).text().not_null().default("[]"))
                    .col(ColumnDef::new(MigrationTokens::ExpiresAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MigrationTokens::SingleUse).boolean().not_null().default(false))
                    .col(ColumnDef::new(MigrationTokens::UsedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationTokens::UsageCount).big_integer().not_null().default(0))
                    .col(ColumnDef::new(MigrationTokens::LastUsedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationTokens::LastUsedIp).string())
                    .col(ColumnDef::new(MigrationTokens::RevokedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(MigrationTokens::CreatedBy).string())
                    .col(ColumnDef::new(MigrationTokens::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // Create migration_token_audits table
        manager
            .create_table(
                Table::create()
                    .table(MigrationTokenAudits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MigrationTokenAudits::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MigrationTokenAudits::TokenId).string())
                    .col(ColumnDef::new(MigrationTokenAudits::Outcome).string().not_null())
                    .col(ColumnDef::new(MigrationTokenAudits::Detail).text())
                    .col(ColumnDef::new(MigrationTokenAudits::ClientIp).string())
                    .col(ColumnDef::new(MigrationTokenAudits::Timestamp).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // Indexes for job and log queries
        manager
            .create_index(
                Index::create()
                    .name("idx-migration_jobs-status")
                    .table(MigrationJobs::Table)
                    .col(MigrationJobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-migration_logs-job_id")
                    .table(MigrationLogs::Table)
                    .col(MigrationLogs::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-migration_token_audits-token_id")
                    .table(MigrationTokenAudits::Table)
                    .col(MigrationTokenAudits::TokenId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MigrationTokenAudits::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MigrationTokens::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MigrationLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MigrationJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MigrationCheckpoints::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(Iden)]
enum MigrationJobs {
    Table,
    Id,
    Kind,
    Status,
    ProgressPercent,
    CurrentStep,
    CreatedBy,
    SourceUrl,
    TargetUrl,
    ArchivePath,
    ArchiveSizeBytes,
    TotalEntities,
    EntitiesCompleted,
    RecordsTotal,
    RecordsProcessed,
    RecordsSkipped,
    FilesTotal,
    FilesProcessed,
    BytesTransferred,
    StartedAt,
    CompletedAt,
    DurationSeconds,
    LastProgressAt,
    ErrorMessage,
    ErrorDetail,
    CheckpointId,
    CancelRequested,
    CreatedAt,
}

#[derive(Iden)]
enum MigrationLogs {
    Table,
    Id,
    JobId,
    Seq,
    Timestamp,
    Level,
    Message,
    EntityKind,
    RecordCount,
    DurationMs,
}

#[derive(Iden)]
enum MigrationCheckpoints {
    Table,
    Id,
    Name,
    SnapshotPath,
    SizeBytes,
    TotalRecords,
    IsValid,
    UsedForRestore,
    RestoredAt,
    ExpiresAt,
    CreatedAt,
}

#[derive(Iden)]
enum MigrationTokens {
    Table,
    Id,
    TokenHash,
    Description,
    Permission,
    AllowedIps,
    AllowedDomains,
    ExpiresAt,
    SingleUse,
    UsedAt,
    UsageCount,
    LastUsedAt,
    LastUsedIp,
    RevokedAt,
    CreatedBy,
    CreatedAt,
}

#[derive(Iden)]
enum MigrationTokenAudits {
    Table,
    Id,
    TokenId,
    Outcome,
    Detail,
    ClientIp,
    Timestamp,
}
