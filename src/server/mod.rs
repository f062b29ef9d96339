pub mod app;
pub mod error;
pub mod handlers;
pub mod middleware;

use clap::Subcommand;

use crate::config::EngineConfig;
use crate::database::{connection::*, migrations::Migrator};
use crate::jobs::spawn_watchdog;
use anyhow::Result;
use sea_orm_migration::prelude::*;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum MigrateDirection {
    Up,
    Down,
    Fresh,
}

pub async fn start_server(port: u16, database_path: &str, config: EngineConfig) -> Result<()> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;

    Migrator::up(&db, None).await?;
    info!("Database migrations completed");

    config.ensure_dirs()?;

    let state = app::AppState::new(db, config);
    spawn_watchdog(state.registry.clone(), state.config.stall_minutes);

    let router = app::create_app(state);

    info!("API Endpoints:");
    info!("  /health               - Health check");
    info!("  /docs                 - Swagger UI documentation");
    info!("  /api/v1/migration/*   - Migration surface (token protected)");

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

pub async fn migrate_database(database_path: &str, direction: MigrateDirection) -> Result<()> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;

    match direction {
        MigrateDirection::Up => {
            info!("Running migrations up");
            Migrator::up(&db, None).await?;
        }
        MigrateDirection::Down => {
            info!("Running migrations down");
            Migrator::down(&db, None).await?;
        }
        MigrateDirection::Fresh => {
            info!("Running fresh migrations (down then up)");
            Migrator::down(&db, None).await?;
            Migrator::up(&db, None).await?;
        }
    }

    info!("Database migration completed");
    Ok(())
}
