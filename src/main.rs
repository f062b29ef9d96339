use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use gangway::catalog::{ApplyPolicy, EntityKind};
use gangway::config::EngineConfig;
use gangway::database::{get_database_url, setup_database};
use gangway::jobs::{JobKind, JobRegistry, TargetLockMap};
use gangway::server;
use gangway::services::export_service::ExportOptions;
use gangway::services::import_service::ImportOptions;
use gangway::services::token_service::{IssueTokenRequest, TokenPermission};
use gangway::services::{
    ExportService, ImportService, IntegrityService, SyncService, TokenService,
};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    /// Engine config file (TOML). Defaults apply when absent.
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
    #[clap(short, long, global = true, default_value = "gangway.db")]
    database: String,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP migration surface.
    Serve {
        #[clap(short, long, default_value = "3000")]
        port: u16,
        /// Override the configured media root.
        #[clap(long)]
        media_root: Option<PathBuf>,
    },
    /// Export platform data into an archive file.
    Export {
        #[clap(short, long, default_value = "export.tar.gz")]
        output: PathBuf,
        /// Entity kinds to include; empty means all.
        #[clap(long)]
        include: Vec<String>,
        #[clap(long)]
        exclude: Vec<String>,
        /// Only export records updated at or after this RFC 3339 timestamp.
        #[clap(long)]
        since: Option<String>,
        #[clap(long)]
        no_media: bool,
    },
    /// Import an archive file into this instance.
    Import {
        archive: PathBuf,
        #[clap(long, default_value = "merge")]
        policy: String,
        #[clap(long)]
        dry_run: bool,
        #[clap(long)]
        no_checkpoint: bool,
        #[clap(long)]
        no_verify: bool,
        #[clap(long)]
        continue_on_error: bool,
    },
    /// Export locally and upload to a remote instance.
    Push {
        #[clap(long)]
        target: String,
        #[clap(long)]
        token: String,
    },
    /// Ask a remote instance for an export and import it here.
    Pull {
        #[clap(long)]
        source: String,
        #[clap(long)]
        token: String,
        #[clap(long, default_value = "merge")]
        policy: String,
    },
    /// Mint a migration token. The raw value prints exactly once.
    CreateToken {
        #[clap(long)]
        description: String,
        #[clap(long, default_value = "read")]
        permission: String,
        #[clap(long)]
        expires_in_hours: Option<i64>,
        #[clap(long)]
        single_use: bool,
    },
    /// Check an archive file, or the database when no file is given.
    Verify {
        #[clap(long)]
        file: Option<PathBuf>,
    },
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Init,
    Migrate {
        #[clap(subcommand)]
        direction: server::MigrateDirection,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Serve { port, media_root } => {
            let mut config = config;
            if let Some(media_root) = media_root {
                config.media_root = media_root;
            }
            info!("Starting server on port {}", port);
            server::start_server(port, &args.database, config).await?;
        }
        Commands::Export {
            output,
            include,
            exclude,
            since,
            no_media,
        } => {
            let db = connect(&args.database).await?;
            let changed_since = since
                .map(|s| s.parse::<chrono::DateTime<chrono::Utc>>())
                .transpose()?;
            let options = ExportOptions {
                include: parse_kinds(&include)?,
                exclude: parse_kinds(&exclude)?,
                changed_since,
                include_media: !no_media,
            };
            let registry = JobRegistry::new(db.clone());
            let exporter = ExportService::new(db, config, registry);
            let summary = exporter.export_to_file(&output, &options, None).await?;
            info!(
                records = summary.records,
                media = summary.media_files,
                bytes = summary.archive_size_bytes,
                "exported to {}",
                output.display()
            );
        }
        Commands::Import {
            archive,
            policy,
            dry_run,
            no_checkpoint,
            no_verify,
            continue_on_error,
        } => {
            let db = connect(&args.database).await?;
            config.ensure_dirs()?;
            let options = ImportOptions {
                policy: policy.parse::<ApplyPolicy>()?,
                verify: !no_verify,
                create_checkpoint: !no_checkpoint,
                dry_run,
                continue_on_error,
                ..ImportOptions::default()
            };
            let registry = JobRegistry::new(db.clone());
            let job = registry.create(JobKind::Import, Some("cli".to_string())).await?;
            let importer =
                ImportService::new(db, config, registry, TargetLockMap::new());
            let outcome = importer.execute(&job.id, &archive, &options).await?;
            info!(
                inserted = outcome.stats.inserted,
                updated = outcome.stats.updated,
                skipped = outcome.stats.skipped,
                dry_run = outcome.dry_run,
                "import finished (job {})",
                job.id
            );
        }
        Commands::Push { target, token } => {
            let db = connect(&args.database).await?;
            config.ensure_dirs()?;
            let registry = JobRegistry::new(db.clone());
            let job = registry.create(JobKind::Push, Some("cli".to_string())).await?;
            let sync = SyncService::new(db, config, registry, TargetLockMap::new());
            let remote_job = sync
                .push(&job.id, &target, &token, &ExportOptions::default())
                .await?;
            info!("push completed; remote job {}", remote_job);
        }
        Commands::Pull {
            source,
            token,
            policy,
        } => {
            let db = connect(&args.database).await?;
            config.ensure_dirs()?;
            let import_options = ImportOptions {
                policy: policy.parse::<ApplyPolicy>()?,
                ..ImportOptions::default()
            };
            let registry = JobRegistry::new(db.clone());
            let job = registry.create(JobKind::Pull, Some("cli".to_string())).await?;
            let sync = SyncService::new(db, config, registry, TargetLockMap::new());
            let outcome = sync
                .pull(
                    &job.id,
                    &source,
                    &token,
                    &ExportOptions::default(),
                    &import_options,
                )
                .await?;
            info!(
                inserted = outcome.stats.inserted,
                updated = outcome.stats.updated,
                "pull completed (job {})",
                job.id
            );
        }
        Commands::CreateToken {
            description,
            permission,
            expires_in_hours,
            single_use,
        } => {
            let db = connect(&args.database).await?;
            let tokens = TokenService::new(db, config.token_default_ttl_hours);
            let issued = tokens
                .issue(IssueTokenRequest {
                    description,
                    permission: Some(permission.parse::<TokenPermission>()?),
                    expires_in_hours,
                    single_use,
                    created_by: Some("cli".to_string()),
                    ..IssueTokenRequest::default()
                })
                .await?;
            println!("{}", issued.token);
            info!(
                id = %issued.model.id,
                expires_at = %issued.model.expires_at,
                "token issued; the value above will not be shown again"
            );
        }
        Commands::Verify { file } => match file {
            Some(file) => {
                let reader = gangway::archive::ArchiveReader::open(&file)?;
                reader.validate()?;
                info!(
                    records = reader.manifest().total_records(),
                    "archive {} is valid",
                    file.display()
                );
            }
            None => {
                let db = connect(&args.database).await?;
                let report = IntegrityService::new(db).verify().await?;
                for (kind, count) in &report.counts {
                    info!("{}: {} rows", kind, count);
                }
                if report.is_clean() {
                    info!("integrity check passed");
                } else {
                    for orphan in &report.orphans {
                        tracing::error!("orphan: {}", orphan);
                    }
                    anyhow::bail!("integrity check found {} orphans", report.orphans.len());
                }
            }
        },
        Commands::Db { command } => match command {
            DbCommands::Init => {
                info!("Initializing database: {}", args.database);
                server::migrate_database(&args.database, server::MigrateDirection::Up).await?;
            }
            DbCommands::Migrate { direction } => {
                info!("Running database migration: {:?}", direction);
                server::migrate_database(&args.database, direction).await?;
            }
        },
    }

    Ok(())
}

async fn connect(database_path: &str) -> Result<DatabaseConnection> {
    Ok(setup_database(&get_database_url(Some(database_path))).await?)
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    Ok(match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    })
}

fn parse_kinds(raw: &[String]) -> Result<Vec<EntityKind>> {
    raw.iter()
        .map(|s| s.parse::<EntityKind>().map_err(Into::into))
        .collect()
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("sqlx=off,{}", log_level)))
        .without_time()
        .init();
}
