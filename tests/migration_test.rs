//! End-to-end engine coverage against real temp-file SQLite databases:
//! export/import round trips, merge semantics, dry runs, checkpoint
//! restore, and the token audit trail.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, PaginatorTrait, Set,
};
use tempfile::TempDir;

use gangway::archive::{sha256_hex, ArchiveWriter, EntitySection, Manifest};
use gangway::catalog::{ApplyPolicy, EntityKind};
use gangway::config::EngineConfig;
use gangway::database::entities::{events, organizers, ticket_tiers, users, venues};
use gangway::database::{get_database_url, setup_database};
use gangway::jobs::{JobKind, JobRegistry, JobStatus, TargetLockMap};
use gangway::services::checkpoint_service::CheckpointService;
use gangway::services::export_service::{ExportOptions, ExportService};
use gangway::services::import_service::{ImportOptions, ImportService};
use gangway::services::token_service::{IssueTokenRequest, TokenPermission, TokenService};
use gangway::services::IntegrityService;

struct TestEnv {
    db: DatabaseConnection,
    config: EngineConfig,
    registry: JobRegistry,
    _dir: TempDir,
}

async fn test_env(name: &str) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join(format!("{}.db", name));
    let db = setup_database(&get_database_url(Some(&db_path.to_string_lossy())))
        .await
        .unwrap();
    let config = EngineConfig {
        environment: name.to_string(),
        archive_dir: dir.path().join("archives"),
        checkpoint_dir: dir.path().join("checkpoints"),
        media_root: dir.path().join("media"),
        ..EngineConfig::default()
    };
    config.ensure_dirs().unwrap();
    let registry = JobRegistry::new(db.clone());
    TestEnv {
        db,
        config,
        registry,
        _dir: dir,
    }
}

fn user_row(email: &str, is_admin: bool) -> users::ActiveModel {
    let mut am = users::ActiveModel::new(email.to_string(), email.to_string());
    am.is_admin = Set(is_admin);
    am
}

async fn seed_platform(db: &DatabaseConnection) {
    let now = Utc::now();
    let alice = user_row("alice@example.com", true).insert(db).await.unwrap();
    user_row("bob@example.com", false).insert(db).await.unwrap();

    let organizer = organizers::ActiveModel {
        id: Set("org-1".to_string()),
        slug: Set("north-stage".to_string()),
        name: Set("North Stage".to_string()),
        contact_email: Set("hello@northstage.test".to_string()),
        owner_id: Set(Some(alice.id)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    let venue = venues::ActiveModel {
        id: Set("venue-1".to_string()),
        slug: Set("old-mill".to_string()),
        name: Set("Old Mill Hall".to_string()),
        address: Set(Some("1 Mill Lane".to_string())),
        city: Set(Some("Tampere".to_string())),
        capacity: Set(Some(400)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    let event = events::ActiveModel {
        id: Set("event-1".to_string()),
        slug: Set("midsummer-gala".to_string()),
        title: Set("Midsummer Gala".to_string()),
        description: Set(None),
        starts_at: Set(now),
        status: Set("published".to_string()),
        organizer_id: Set(organizer.id),
        venue_id: Set(Some(venue.id)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();

    ticket_tiers::ActiveModel {
        id: Set("tier-1".to_string()),
        event_id: Set(event.id),
        name: Set("General".to_string()),
        price_cents: Set(2500),
        quantity: Set(350),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .unwrap();
}

fn data_only() -> ExportOptions {
    ExportOptions {
        include_media: false,
        ..ExportOptions::default()
    }
}

#[tokio::test]
async fn export_import_round_trip_moves_every_row() {
    let source = test_env("source").await;
    seed_platform(&source.db).await;

    let archive = source._dir.path().join("roundtrip.tar.gz");
    let exporter = ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    );
    let summary = exporter
        .export_to_file(&archive, &data_only(), None)
        .await
        .unwrap();
    assert_eq!(summary.records, 6);

    let target = test_env("target").await;
    let job = target
        .registry
        .create(JobKind::Import, None)
        .await
        .unwrap();
    let importer = ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    );
    let outcome = importer
        .execute(&job.id, &archive, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.stats.inserted, 6);
    assert!(!outcome.rolled_back);

    assert_eq!(users::Entity::find().count(&target.db).await.unwrap(), 2);
    assert_eq!(events::Entity::find().count(&target.db).await.unwrap(), 1);

    let finished = target.registry.get(&job.id).await.unwrap();
    assert_eq!(finished.status, "completed");
    assert_eq!(finished.progress_percent, 100);

    let report = IntegrityService::new(target.db.clone()).verify().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn merge_keeps_local_id_and_admin_flag() {
    let source = test_env("source").await;
    user_row("shared@example.com", false).insert(&source.db).await.unwrap();
    let archive = source._dir.path().join("merge.tar.gz");
    ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    )
    .export_to_file(&archive, &data_only(), None)
    .await
    .unwrap();

    let target = test_env("target").await;
    let local = user_row("shared@example.com", true)
        .insert(&target.db)
        .await
        .unwrap();

    let job = target.registry.create(JobKind::Import, None).await.unwrap();
    ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    )
    .execute(&job.id, &archive, &ImportOptions::default())
    .await
    .unwrap();

    let rows = users::Entity::find().all(&target.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    // The incoming row matched on email; the local primary key and the
    // protected admin flag both survive the merge.
    assert_eq!(rows[0].id, local.id);
    assert!(rows[0].is_admin);
}

#[tokio::test]
async fn dry_run_mutates_nothing() {
    let source = test_env("source").await;
    seed_platform(&source.db).await;
    let archive = source._dir.path().join("dry.tar.gz");
    ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    )
    .export_to_file(&archive, &data_only(), None)
    .await
    .unwrap();

    let target = test_env("target").await;
    let job = target.registry.create(JobKind::Import, None).await.unwrap();
    let outcome = ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    )
    .execute(
        &job.id,
        &archive,
        &ImportOptions {
            dry_run: true,
            ..ImportOptions::default()
        },
    )
    .await
    .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(users::Entity::find().count(&target.db).await.unwrap(), 0);
    let finished = target.registry.get(&job.id).await.unwrap();
    assert_eq!(finished.status, "completed");
}

#[tokio::test]
async fn checkpoint_restore_returns_to_prior_state() {
    let env = test_env("env").await;
    seed_platform(&env.db).await;

    let checkpoints =
        CheckpointService::new(env.db.clone(), env.config.clone(), env.registry.clone());
    let checkpoint = checkpoints.create("before destructive change").await.unwrap();
    assert!(checkpoint.is_valid);

    // Wreck the environment, then ask for the checkpoint back.
    users::Entity::delete_many().exec(&env.db).await.unwrap();
    user_row("intruder@example.com", false)
        .insert(&env.db)
        .await
        .unwrap();

    checkpoints.restore(&checkpoint.id).await.unwrap();

    let emails: Vec<String> = users::Entity::find()
        .all(&env.db)
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.email)
        .collect();
    assert_eq!(emails.len(), 2);
    assert!(emails.contains(&"alice@example.com".to_string()));
    assert!(!emails.contains(&"intruder@example.com".to_string()));

    // A checkpoint is single use.
    let spent = checkpoints.get(&checkpoint.id).await.unwrap();
    assert!(!spent.is_valid);
    assert!(checkpoints.restore(&checkpoint.id).await.is_err());
}

#[tokio::test]
async fn overwrite_policy_does_not_protect_the_admin_flag() {
    let source = test_env("source").await;
    user_row("shared@example.com", false).insert(&source.db).await.unwrap();
    let archive = source._dir.path().join("overwrite.tar.gz");
    ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    )
    .export_to_file(&archive, &data_only(), None)
    .await
    .unwrap();

    let target = test_env("target").await;
    let local = user_row("shared@example.com", true)
        .insert(&target.db)
        .await
        .unwrap();

    let job = target.registry.create(JobKind::Import, None).await.unwrap();
    ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    )
    .execute(
        &job.id,
        &archive,
        &ImportOptions {
            policy: ApplyPolicy::Overwrite,
            ..ImportOptions::default()
        },
    )
    .await
    .unwrap();

    let rows = users::Entity::find().all(&target.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    // The row identity survives, but overwrite takes the source's flags
    // verbatim where merge would have kept the local admin bit.
    assert_eq!(rows[0].id, local.id);
    assert!(!rows[0].is_admin);
}

#[tokio::test]
async fn job_cancel_flag_round_trips() {
    let env = test_env("env").await;
    let job = env.registry.create(JobKind::Export, None).await.unwrap();
    assert!(!env.registry.is_cancel_requested(&job.id).await.unwrap());
    env.registry.request_cancel(&job.id).await.unwrap();
    assert!(env.registry.is_cancel_requested(&job.id).await.unwrap());

    env.registry
        .transition(&job.id, JobStatus::Validating)
        .await
        .unwrap();
    env.registry.complete(&job.id).await.unwrap_err();
}

#[tokio::test]
async fn token_validation_leaves_an_audit_trail() {
    let env = test_env("env").await;
    let tokens = TokenService::new(env.db.clone(), 24);
    let issued = tokens
        .issue(IssueTokenRequest {
            description: "pull from staging".to_string(),
            permission: Some(TokenPermission::Read),
            ..IssueTokenRequest::default()
        })
        .await
        .unwrap();
    assert!(issued.token.starts_with("mgt_"));

    tokens
        .validate(&issued.token, TokenPermission::Read, None, None)
        .await
        .unwrap();
    tokens
        .validate(&issued.token, TokenPermission::Write, None, None)
        .await
        .unwrap_err();
    tokens
        .validate("mgt_not_a_real_token", TokenPermission::Read, None, None)
        .await
        .unwrap_err();

    let audits = tokens.audits_for(&issued.model.id).await.unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].outcome, "accepted");
    assert_eq!(audits[1].outcome, "rejected");
}

#[tokio::test]
async fn expired_token_is_rejected_even_for_reads() {
    let env = test_env("env").await;
    let tokens = TokenService::new(env.db.clone(), 24);

    // A non-positive lifetime never makes it past issue.
    assert!(tokens
        .issue(IssueTokenRequest {
            description: "never valid".to_string(),
            expires_in_hours: Some(0),
            ..IssueTokenRequest::default()
        })
        .await
        .is_err());

    // A token that has aged past its expiry fails at validation time.
    let issued = tokens
        .issue(IssueTokenRequest {
            description: "short lived".to_string(),
            permission: Some(TokenPermission::Read),
            expires_in_hours: Some(1),
            ..IssueTokenRequest::default()
        })
        .await
        .unwrap();
    let mut am = issued.model.clone().into_active_model();
    am.expires_at = Set(Utc::now() - chrono::Duration::hours(2));
    am.update(&env.db).await.unwrap();

    tokens
        .validate(&issued.token, TokenPermission::Read, None, None)
        .await
        .unwrap_err();
    let audits = tokens.audits_for(&issued.model.id).await.unwrap();
    assert_eq!(audits.last().unwrap().outcome, "rejected");
}

#[tokio::test]
async fn single_use_token_is_consumed_by_first_use() {
    let env = test_env("env").await;
    let tokens = TokenService::new(env.db.clone(), 24);
    let issued = tokens
        .issue(IssueTokenRequest {
            description: "one-shot pull".to_string(),
            permission: Some(TokenPermission::Read),
            single_use: true,
            ..IssueTokenRequest::default()
        })
        .await
        .unwrap();

    tokens
        .validate(&issued.token, TokenPermission::Read, None, None)
        .await
        .unwrap();
    tokens
        .validate(&issued.token, TokenPermission::Read, None, None)
        .await
        .unwrap_err();

    let audits = tokens.audits_for(&issued.model.id).await.unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].outcome, "accepted");
    assert_eq!(audits[1].outcome, "rejected");
}

#[tokio::test]
async fn skip_existing_import_is_idempotent() {
    let source = test_env("source").await;
    seed_platform(&source.db).await;
    let archive = source._dir.path().join("idempotent.tar.gz");
    ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    )
    .export_to_file(&archive, &data_only(), None)
    .await
    .unwrap();

    let target = test_env("target").await;
    let importer = ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    );
    let options = ImportOptions {
        policy: ApplyPolicy::SkipExisting,
        ..ImportOptions::default()
    };

    let first = target.registry.create(JobKind::Import, None).await.unwrap();
    let outcome = importer.execute(&first.id, &archive, &options).await.unwrap();
    assert_eq!(outcome.stats.inserted, 6);
    assert_eq!(outcome.stats.skipped, 0);

    let second = target.registry.create(JobKind::Import, None).await.unwrap();
    let outcome = importer.execute(&second.id, &archive, &options).await.unwrap();
    assert_eq!(outcome.stats.inserted, 0);
    assert_eq!(outcome.stats.skipped, 6);

    assert_eq!(users::Entity::find().count(&target.db).await.unwrap(), 2);
    assert_eq!(events::Entity::find().count(&target.db).await.unwrap(), 1);
    let finished = target.registry.get(&second.id).await.unwrap();
    assert_eq!(finished.status, "completed");
    assert_eq!(finished.records_skipped, 6);
}

#[tokio::test]
async fn archive_applies_in_manifest_order_not_entry_order() {
    let env = test_env("target").await;
    let now = Utc::now();
    let user = users::Model {
        id: "u-1".to_string(),
        email: "owner@example.com".to_string(),
        display_name: "Owner".to_string(),
        password_hash: String::new(),
        is_admin: false,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    let organizer = organizers::Model {
        id: "org-1".to_string(),
        slug: "north-stage".to_string(),
        name: "North Stage".to_string(),
        contact_email: "hello@northstage.test".to_string(),
        owner_id: Some(user.id.clone()),
        created_at: now,
        updated_at: now,
    };

    // The tar carries the child kind before its parent on purpose; apply
    // order must come from the manifest, not from entry order.
    let archive = env._dir.path().join("shuffled.tar.gz");
    let mut writer = ArchiveWriter::create(&archive).unwrap();
    let org_bytes = writer
        .append_chunk(
            EntityKind::Organizers,
            0,
            &[serde_json::to_value(&organizer).unwrap()],
        )
        .unwrap();
    let user_bytes = writer
        .append_chunk(EntityKind::Users, 0, &[serde_json::to_value(&user).unwrap()])
        .unwrap();
    let mut manifest = Manifest::new("shuffle-test");
    manifest.entities.insert(
        "users".to_string(),
        EntitySection {
            count: 1,
            chunk_count: 1,
            checksum: sha256_hex(&user_bytes),
        },
    );
    manifest.entities.insert(
        "organizers".to_string(),
        EntitySection {
            count: 1,
            chunk_count: 1,
            checksum: sha256_hex(&org_bytes),
        },
    );
    writer.finish(&manifest).unwrap();

    let job = env.registry.create(JobKind::Import, None).await.unwrap();
    let outcome = ImportService::new(
        env.db.clone(),
        env.config.clone(),
        env.registry.clone(),
        TargetLockMap::new(),
    )
    .execute(&job.id, &archive, &ImportOptions::default())
    .await
    .unwrap();

    assert_eq!(outcome.stats.inserted, 2);
    assert_eq!(users::Entity::find().count(&env.db).await.unwrap(), 1);
    assert_eq!(organizers::Entity::find().count(&env.db).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_file_counters_do_not_lose_increments() {
    let env = test_env("env").await;
    let job = env.registry.create(JobKind::Pull, None).await.unwrap();
    env.registry.set_file_totals(&job.id, 32).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let registry = env.registry.clone();
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move { registry.add_file(&job_id, 10).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let job = env.registry.get(&job.id).await.unwrap();
    assert_eq!(job.files_processed, 32);
    assert_eq!(job.bytes_transferred, 320);
}

#[tokio::test]
async fn concurrent_log_writers_get_distinct_sequence_numbers() {
    use gangway::jobs::LogLevel;

    let env = test_env("env").await;
    let job = env.registry.create(JobKind::Import, None).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let registry = env.registry.clone();
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move {
            registry
                .log(&job_id, LogLevel::Info, &format!("entry {}", n))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let entries = env.registry.logs(&job.id).await.unwrap();
    assert_eq!(entries.len(), 16);
    let mut seqs: Vec<i64> = entries.iter().map(|e| e.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=16).collect::<Vec<i64>>());
}

#[tokio::test]
async fn deferred_import_leaves_the_job_live_for_follow_up_work() {
    let source = test_env("source").await;
    seed_platform(&source.db).await;
    let archive = source._dir.path().join("deferred.tar.gz");
    ExportService::new(
        source.db.clone(),
        source.config.clone(),
        source.registry.clone(),
    )
    .export_to_file(&archive, &data_only(), None)
    .await
    .unwrap();

    let target = test_env("target").await;
    let job = target.registry.create(JobKind::Pull, None).await.unwrap();
    target
        .registry
        .transition(&job.id, JobStatus::Downloading)
        .await
        .unwrap();
    let importer = ImportService::new(
        target.db.clone(),
        target.config.clone(),
        target.registry.clone(),
        TargetLockMap::new(),
    );
    let outcome = importer
        .execute_deferring_completion(&job.id, &archive, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.stats.inserted, 6);

    // Still live: the caller owns the rest of the pipeline and completion.
    let mid = target.registry.get(&job.id).await.unwrap();
    assert_eq!(mid.status, "verifying");
    target.registry.complete(&job.id).await.unwrap();
    let done = target.registry.get(&job.id).await.unwrap();
    assert_eq!(done.status, "completed");
}
