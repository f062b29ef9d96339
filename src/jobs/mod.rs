//! Job registry: the state machine, progress tracker and append-only log
//! every long-running migration operation reports into.
//!
//! Jobs live in the `migration_jobs` table and are mutated only through this
//! registry. The registry also owns the advisory per-target lock, the
//! in-process service gate used during destructive restores, and the
//! watchdog that fails stalled jobs.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, Statement,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::catalog::EntityKind;
use crate::database::entities::{migration_jobs, migration_logs};
use crate::errors::{MigrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Export,
    Import,
    Push,
    Pull,
    Restore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Export => "export",
            JobKind::Import => "import",
            JobKind::Push => "push",
            JobKind::Pull => "pull",
            JobKind::Restore => "restore",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of job states. Forward-only; see [`JobStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Validating,
    Exporting,
    Downloading,
    Packaging,
    Checkpointing,
    Applying,
    Restoring,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Validating => "validating",
            JobStatus::Exporting => "exporting",
            JobStatus::Downloading => "downloading",
            JobStatus::Packaging => "packaging",
            JobStatus::Checkpointing => "checkpointing",
            JobStatus::Applying => "applying",
            JobStatus::Restoring => "restoring",
            JobStatus::Verifying => "verifying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RolledBack
        )
    }

    /// Position in the forward pipeline. Parallel phases share a rank.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Validating => 1,
            JobStatus::Exporting | JobStatus::Downloading => 2,
            JobStatus::Packaging | JobStatus::Checkpointing => 3,
            JobStatus::Applying | JobStatus::Restoring => 4,
            JobStatus::Verifying => 5,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RolledBack => 6,
        }
    }

    /// Forward transitions only. Any non-terminal state may fail;
    /// `failed` may become `rolled_back`; `completed` may only follow
    /// `verifying`. Nothing ever moves backwards.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Completed, _) | (JobStatus::RolledBack, _) => false,
            (JobStatus::Failed, JobStatus::RolledBack) => true,
            (JobStatus::Failed, _) => false,
            (_, JobStatus::Failed) => true,
            (_, JobStatus::RolledBack) => false,
            (from, JobStatus::Completed) => *from == JobStatus::Verifying,
            (_, JobStatus::Created) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobStatus::Created),
            "validating" => Ok(JobStatus::Validating),
            "exporting" => Ok(JobStatus::Exporting),
            "downloading" => Ok(JobStatus::Downloading),
            "packaging" => Ok(JobStatus::Packaging),
            "checkpointing" => Ok(JobStatus::Checkpointing),
            "applying" => Ok(JobStatus::Applying),
            "restoring" => Ok(JobStatus::Restoring),
            "verifying" => Ok(JobStatus::Verifying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "rolled_back" => Ok(JobStatus::RolledBack),
            other => Err(MigrationError::FatalSystem(format!(
                "unknown job status in store: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone)]
pub struct JobRegistry {
    db: DatabaseConnection,
}

impl JobRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        kind: JobKind,
        created_by: Option<String>,
    ) -> Result<migration_jobs::Model> {
        let job = migration_jobs::ActiveModel::new(kind.as_str(), created_by)
            .insert(&self.db)
            .await?;
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<migration_jobs::Model> {
        migration_jobs::Entity::find_by_id(job_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("job {}", job_id)))
    }

    pub async fn list(&self) -> Result<Vec<migration_jobs::Model>> {
        Ok(migration_jobs::Entity::find()
            .order_by_desc(migration_jobs::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub fn status_of(job: &migration_jobs::Model) -> Result<JobStatus> {
        job.status.parse()
    }

    /// Move a job to `to`, or fail with `FatalSystem` on an illegal
    /// transition. Illegal transitions are programming errors, not
    /// operator errors.
    pub async fn transition(&self, job_id: &str, to: JobStatus) -> Result<migration_jobs::Model> {
        let job = self.get(job_id).await?;
        let from: JobStatus = job.status.parse()?;
        if !from.can_transition(to) {
            return Err(MigrationError::FatalSystem(format!(
                "invalid job transition: {} -> {}",
                from, to
            )));
        }
        let now = Utc::now();
        let started_at = job.started_at;
        let mut am = job.into_active_model();
        am.status = Set(to.as_str().to_string());
        am.last_progress_at = Set(Some(now));
        if from == JobStatus::Created {
            am.started_at = Set(Some(now));
        }
        if to.is_terminal() {
            am.completed_at = Set(Some(now));
            if let Some(started) = started_at {
                am.duration_seconds = Set(Some((now - started).num_seconds()));
            }
        }
        Ok(am.update(&self.db).await?)
    }

    /// Update the step label and raise progress. Progress never decreases
    /// while the job is live.
    pub async fn progress(&self, job_id: &str, percent: i32, step: &str) -> Result<()> {
        let job = self.get(job_id).await?;
        let current = job.progress_percent;
        let mut am = job.into_active_model();
        am.progress_percent = Set(current.max(percent.clamp(0, 100)));
        am.current_step = Set(step.to_string());
        am.last_progress_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_entity_totals(
        &self,
        job_id: &str,
        total_entities: i32,
        records_total: i64,
    ) -> Result<()> {
        let mut am = self.get(job_id).await?.into_active_model();
        am.total_entities = Set(total_entities);
        am.records_total = Set(records_total);
        am.last_progress_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn add_records(&self, job_id: &str, processed: i64, skipped: i64) -> Result<()> {
        let job = self.get(job_id).await?;
        let (p, s) = (job.records_processed, job.records_skipped);
        let mut am = job.into_active_model();
        am.records_processed = Set(p + processed);
        am.records_skipped = Set(s + skipped);
        am.last_progress_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn entity_completed(&self, job_id: &str) -> Result<()> {
        let job = self.get(job_id).await?;
        let done = job.entities_completed;
        let mut am = job.into_active_model();
        am.entities_completed = Set(done + 1);
        am.last_progress_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_file_totals(&self, job_id: &str, files_total: i64) -> Result<()> {
        let mut am = self.get(job_id).await?.into_active_model();
        am.files_total = Set(files_total);
        am.last_progress_at = Set(Some(Utc::now()));
        am.update(&self.db).await?;
        Ok(())
    }

    /// One completed file transfer. Called concurrently from the worker
    /// pool, so the counters go up in a single atomic UPDATE instead of a
    /// read-modify-write.
    pub async fn add_file(&self, job_id: &str, bytes: i64) -> Result<()> {
        let res = migration_jobs::Entity::update_many()
            .col_expr(
                migration_jobs::Column::FilesProcessed,
                Expr::col(migration_jobs::Column::FilesProcessed).add(1),
            )
            .col_expr(
                migration_jobs::Column::BytesTransferred,
                Expr::col(migration_jobs::Column::BytesTransferred).add(bytes),
            )
            .col_expr(
                migration_jobs::Column::LastProgressAt,
                Expr::value(Utc::now()),
            )
            .filter(migration_jobs::Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(MigrationError::NotFound(format!("job {}", job_id)));
        }
        Ok(())
    }

    pub async fn set_archive(&self, job_id: &str, path: &str, size_bytes: i64) -> Result<()> {
        let mut am = self.get(job_id).await?.into_active_model();
        am.archive_path = Set(Some(path.to_string()));
        am.archive_size_bytes = Set(Some(size_bytes));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_urls(
        &self,
        job_id: &str,
        source_url: Option<String>,
        target_url: Option<String>,
    ) -> Result<()> {
        let mut am = self.get(job_id).await?.into_active_model();
        if source_url.is_some() {
            am.source_url = Set(source_url);
        }
        if target_url.is_some() {
            am.target_url = Set(target_url);
        }
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_checkpoint(&self, job_id: &str, checkpoint_id: &str) -> Result<()> {
        let mut am = self.get(job_id).await?.into_active_model();
        am.checkpoint_id = Set(Some(checkpoint_id.to_string()));
        am.update(&self.db).await?;
        Ok(())
    }

    pub async fn log(&self, job_id: &str, level: LogLevel, message: &str) -> Result<()> {
        self.log_entity(job_id, level, message, None, None, None).await
    }

    pub async fn log_entity(
        &self,
        job_id: &str,
        level: LogLevel,
        message: &str,
        entity_kind: Option<EntityKind>,
        record_count: Option<i64>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        // The sequence number is assigned inside the INSERT so concurrent
        // writers (transfer workers logging retries) cannot collide.
        self.db
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "INSERT INTO migration_logs \
                 (job_id, seq, timestamp, level, message, entity_kind, record_count, duration_ms) \
                 VALUES ($1, \
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM migration_logs WHERE job_id = $2), \
                 $3, $4, $5, $6, $7, $8)",
                [
                    job_id.into(),
                    job_id.into(),
                    Utc::now().into(),
                    level.as_str().into(),
                    message.into(),
                    entity_kind.map(|k| k.as_str()).into(),
                    record_count.into(),
                    duration_ms.into(),
                ],
            ))
            .await?;
        Ok(())
    }

    pub async fn logs(&self, job_id: &str) -> Result<Vec<migration_logs::Model>> {
        self.get(job_id).await?;
        Ok(migration_logs::Entity::find()
            .filter(migration_logs::Column::JobId.eq(job_id))
            .order_by_asc(migration_logs::Column::Seq)
            .all(&self.db)
            .await?)
    }

    /// Record a terminal failure: status, error fields and an error-level
    /// log entry.
    pub async fn fail(&self, job_id: &str, err: &MigrationError) -> Result<()> {
        let job = self.get(job_id).await?;
        let status: JobStatus = job.status.parse()?;
        if !status.can_transition(JobStatus::Failed) {
            warn!(job_id, status = %status, "cannot fail job in terminal state");
            return Ok(());
        }
        let now = Utc::now();
        let started = job.started_at;
        let mut am = job.into_active_model();
        am.status = Set(JobStatus::Failed.as_str().to_string());
        am.error_message = Set(Some(err.to_string()));
        am.error_detail = Set(Some(format!("{}: {:?}", err.error_code(), err)));
        am.completed_at = Set(Some(now));
        if let Some(started) = started {
            am.duration_seconds = Set(Some((now - started).num_seconds()));
        }
        am.update(&self.db).await?;
        self.log(job_id, LogLevel::Error, &err.to_string()).await?;
        error!(job_id, error = %err, "job failed");
        Ok(())
    }

    pub async fn complete(&self, job_id: &str) -> Result<migration_jobs::Model> {
        self.progress(job_id, 100, "completed").await?;
        let job = self.transition(job_id, JobStatus::Completed).await?;
        self.log(job_id, LogLevel::Info, "job completed").await?;
        Ok(job)
    }

    pub async fn request_cancel(&self, job_id: &str) -> Result<()> {
        let job = self.get(job_id).await?;
        let status: JobStatus = job.status.parse()?;
        if status.is_terminal() {
            return Err(MigrationError::Conflict(format!(
                "job {} already {}",
                job_id, status
            )));
        }
        let mut am = job.into_active_model();
        am.cancel_requested = Set(true);
        am.update(&self.db).await?;
        Ok(())
    }

    /// Polled by engines between chunks and files, never mid-chunk.
    pub async fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        Ok(self.get(job_id).await?.cancel_requested)
    }

    /// Fail every live job whose last progress update is older than the
    /// stall window.
    pub async fn fail_stalled(&self, stall_minutes: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::minutes(stall_minutes);
        let live = migration_jobs::Entity::find()
            .filter(migration_jobs::Column::Status.is_not_in(vec![
                JobStatus::Completed.as_str(),
                JobStatus::Failed.as_str(),
                JobStatus::RolledBack.as_str(),
                JobStatus::Created.as_str(),
            ]))
            .all(&self.db)
            .await?;
        let mut failed = 0;
        for job in live {
            let stalled = match job.last_progress_at {
                Some(at) => at < cutoff,
                None => job.created_at < cutoff,
            };
            if stalled {
                let err = MigrationError::FatalSystem(format!(
                    "no progress for {} minutes, presumed crashed",
                    stall_minutes
                ));
                self.fail(&job.id, &err).await?;
                failed += 1;
            }
        }
        Ok(failed)
    }
}

/// Periodic stalled-job sweep.
pub fn spawn_watchdog(
    registry: JobRegistry,
    stall_minutes: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match registry.fail_stalled(stall_minutes).await {
                Ok(0) => {}
                Ok(n) => warn!(count = n, "watchdog failed stalled jobs"),
                Err(e) => error!(error = %e, "watchdog sweep failed"),
            }
        }
    })
}

/// Advisory lock keyed by target environment identifier. Destructive jobs
/// take it before mutating; a second destructive job against the same
/// target is rejected rather than queued.
#[derive(Clone, Default)]
pub struct TargetLockMap {
    held: Arc<Mutex<HashSet<String>>>,
}

impl TargetLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, target: &str) -> Result<TargetLock> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| MigrationError::FatalSystem("target lock map poisoned".to_string()))?;
        if !held.insert(target.to_string()) {
            return Err(MigrationError::Conflict(format!(
                "a destructive operation is already running against {}",
                target
            )));
        }
        Ok(TargetLock {
            held: Arc::clone(&self.held),
            key: target.to_string(),
        })
    }
}

pub struct TargetLock {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

/// In-process pause flag for the destructive restore window. While paused,
/// mutating migration endpoints answer 503.
#[derive(Clone, Default)]
pub struct ServiceGate {
    paused: Arc<AtomicBool>,
}

impl ServiceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(JobStatus::Created.can_transition(JobStatus::Validating));
        assert!(JobStatus::Validating.can_transition(JobStatus::Exporting));
        assert!(JobStatus::Validating.can_transition(JobStatus::Downloading));
        assert!(JobStatus::Validating.can_transition(JobStatus::Checkpointing));
        assert!(JobStatus::Exporting.can_transition(JobStatus::Packaging));
        assert!(JobStatus::Checkpointing.can_transition(JobStatus::Applying));
        assert!(JobStatus::Applying.can_transition(JobStatus::Verifying));
        assert!(JobStatus::Verifying.can_transition(JobStatus::Completed));
    }

    #[test]
    fn backward_and_sideways_transitions_are_rejected() {
        assert!(!JobStatus::Applying.can_transition(JobStatus::Validating));
        assert!(!JobStatus::Verifying.can_transition(JobStatus::Exporting));
        assert!(!JobStatus::Exporting.can_transition(JobStatus::Downloading));
        assert!(!JobStatus::Applying.can_transition(JobStatus::Created));
    }

    #[test]
    fn completed_only_follows_verifying() {
        assert!(!JobStatus::Applying.can_transition(JobStatus::Completed));
        assert!(!JobStatus::Created.can_transition(JobStatus::Completed));
        assert!(JobStatus::Verifying.can_transition(JobStatus::Completed));
    }

    #[test]
    fn any_live_state_can_fail_and_only_failed_rolls_back() {
        for status in [
            JobStatus::Created,
            JobStatus::Validating,
            JobStatus::Exporting,
            JobStatus::Applying,
            JobStatus::Verifying,
        ] {
            assert!(status.can_transition(JobStatus::Failed));
            assert!(!status.can_transition(JobStatus::RolledBack));
        }
        assert!(JobStatus::Failed.can_transition(JobStatus::RolledBack));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Applying));
    }

    #[test]
    fn terminal_states_are_frozen() {
        for terminal in [JobStatus::Completed, JobStatus::RolledBack] {
            for target in [
                JobStatus::Created,
                JobStatus::Validating,
                JobStatus::Failed,
                JobStatus::RolledBack,
            ] {
                assert!(!terminal.can_transition(target));
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Created,
            JobStatus::Validating,
            JobStatus::Exporting,
            JobStatus::Downloading,
            JobStatus::Packaging,
            JobStatus::Checkpointing,
            JobStatus::Applying,
            JobStatus::Restoring,
            JobStatus::Verifying,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn target_lock_rejects_second_holder_and_releases_on_drop() {
        let locks = TargetLockMap::new();
        let guard = locks.acquire("https://target.example").unwrap();
        let second = locks.acquire("https://target.example");
        assert!(matches!(second, Err(MigrationError::Conflict(_))));
        // A different target is unaffected
        let _other = locks.acquire("https://other.example").unwrap();
        drop(guard);
        assert!(locks.acquire("https://target.example").is_ok());
    }

    #[test]
    fn service_gate_toggles() {
        let gate = ServiceGate::new();
        assert!(!gate.is_paused());
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }
}
