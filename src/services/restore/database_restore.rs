//! Database-level restore: operates below the entity layer by attaching
//! the bundle's SQLite snapshot and replacing the platform tables
//! wholesale, with row-count verification per table.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter, Set, Statement,
};
use tracing::{info, warn};

use crate::catalog::EntityKind;
use crate::database::entities::users;
use crate::errors::{MigrationError, Result};

fn quote_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

/// Dump the live database to a timestamped file before any destructive
/// step. Distinct from a checkpoint; this is the last-resort manual
/// recovery artifact.
pub async fn safety_backup(db: &DatabaseConnection, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "safety-backup-{}.db",
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    db.execute_unprepared(&format!("VACUUM INTO '{}'", quote_path(&path)))
        .await?;
    if !path.is_file() {
        return Err(MigrationError::FatalSystem(
            "safety backup file was not produced".to_string(),
        ));
    }
    info!(path = %path.display(), "safety backup written");
    Ok(path)
}

/// Local users with elevated privileges, captured before the wipe so they
/// survive a restore from a bundle that does not know them.
pub async fn snapshot_admins(db: &DatabaseConnection) -> Result<Vec<users::Model>> {
    Ok(users::Entity::find()
        .filter(users::Column::IsAdmin.eq(true))
        .all(db)
        .await?)
}

/// Re-grant or re-create the captured admins after the snapshot has been
/// loaded. Matched by email; a missing row is inserted back verbatim.
pub async fn reinstate_admins(db: &DatabaseConnection, admins: &[users::Model]) -> Result<usize> {
    let mut reinstated = 0;
    for admin in admins {
        let existing = users::Entity::find()
            .filter(users::Column::Email.eq(admin.email.clone()))
            .one(db)
            .await?;
        match existing {
            Some(user) if !user.is_admin => {
                let mut am = user.into_active_model();
                am.is_admin = Set(true);
                am.update(db).await?;
                reinstated += 1;
            }
            Some(_) => {}
            None => {
                admin
                    .clone()
                    .into_active_model()
                    .reset_all()
                    .insert(db)
                    .await?;
                reinstated += 1;
            }
        }
    }
    Ok(reinstated)
}

/// Rows per platform table after a restore, in dependency order.
#[derive(Debug, Clone, Default)]
pub struct RestoreCounts {
    pub per_table: Vec<(String, i64)>,
}

impl RestoreCounts {
    pub fn total(&self) -> i64 {
        self.per_table.iter().map(|(_, n)| n).sum()
    }
}

async fn count_rows(db: &DatabaseConnection, qualified_table: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            DatabaseBackend::Sqlite,
            format!("SELECT COUNT(*) AS c FROM {}", qualified_table),
        ))
        .await?
        .ok_or_else(|| {
            MigrationError::FatalSystem(format!("count query returned no row for {}", qualified_table))
        })?;
    Ok(row.try_get::<i64>("", "c")?)
}

/// Filesystem path of the `main` database behind a connection.
async fn main_database_path(db: &DatabaseConnection) -> Result<String> {
    let row = db
        .query_one(Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT file FROM pragma_database_list WHERE name = 'main'".to_string(),
        ))
        .await?
        .ok_or_else(|| {
            MigrationError::FatalSystem("pragma_database_list returned no main entry".to_string())
        })?;
    let path: String = row.try_get("", "file")?;
    if path.is_empty() {
        return Err(MigrationError::FatalSystem(
            "main database has no file path, cannot restore in place".to_string(),
        ));
    }
    Ok(path)
}

/// Replace every platform table with the snapshot's contents. Deletes run
/// children-first, inserts parents-first, and each table's row count is
/// verified against the snapshot before committing.
///
/// ATTACH is connection-scoped in SQLite, so the whole replace runs on a
/// dedicated single-connection handle to the same database file rather
/// than the shared pool. The destructive window sits inside one explicit
/// transaction on that connection; an abort rolls back when the handle is
/// closed.
pub async fn restore_database(
    db: &DatabaseConnection,
    snapshot: &Path,
) -> Result<RestoreCounts> {
    let main_path = main_database_path(db).await?;
    let mut opts = ConnectOptions::new(format!("sqlite:{}?mode=rw", main_path));
    opts.max_connections(1).sqlx_logging(false);
    let conn = Database::connect(opts).await?;

    let result = replace_on(&conn, snapshot).await;
    if let Err(err) = conn.close().await {
        warn!(error = %err, "failed to close restore connection");
    }
    result
}

async fn replace_on(conn: &DatabaseConnection, snapshot: &Path) -> Result<RestoreCounts> {
    conn.execute_unprepared(&format!(
        "ATTACH DATABASE '{}' AS incoming",
        quote_path(snapshot)
    ))
    .await?;

    let result = replace_tables(conn).await;
    let detach = conn.execute_unprepared("DETACH DATABASE incoming").await;
    let counts = result?;
    detach?;
    Ok(counts)
}

async fn replace_tables(conn: &DatabaseConnection) -> Result<RestoreCounts> {
    conn.execute_unprepared("BEGIN IMMEDIATE").await?;
    match replace_in_transaction(conn).await {
        Ok(counts) => {
            conn.execute_unprepared("COMMIT").await?;
            Ok(counts)
        }
        Err(err) => {
            let _ = conn.execute_unprepared("ROLLBACK").await;
            Err(err)
        }
    }
}

async fn replace_in_transaction(conn: &DatabaseConnection) -> Result<RestoreCounts> {
    let tables: Vec<&'static str> = EntityKind::dependency_order()
        .iter()
        .map(|k| k.as_str())
        .collect();

    // Resets at COMMIT, so it must be issued inside the transaction.
    conn.execute_unprepared("PRAGMA defer_foreign_keys = ON").await?;
    for table in tables.iter().rev() {
        conn.execute_unprepared(&format!("DELETE FROM {}", table))
            .await?;
    }

    let mut counts = RestoreCounts::default();
    for table in &tables {
        conn.execute_unprepared(&format!(
            "INSERT INTO {table} SELECT * FROM incoming.{table}",
            table = table
        ))
        .await?;
        let restored = count_rows(conn, table).await?;
        let expected = count_rows(conn, &format!("incoming.{}", table)).await?;
        if restored != expected {
            return Err(MigrationError::Integrity(format!(
                "row count mismatch for {}: snapshot {} restored {}",
                table, expected, restored
            )));
        }
        counts.per_table.push((table.to_string(), restored));
    }
    Ok(counts)
}
