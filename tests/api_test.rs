//! HTTP surface coverage: token gating per route, scheme strictness, the
//! restore-window 503, and the token lifecycle.

use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;

use gangway::config::EngineConfig;
use gangway::database::{get_database_url, setup_database};
use gangway::jobs::JobKind;
use gangway::server::app::{create_app, AppState};
use gangway::services::token_service::{IssueTokenRequest, TokenPermission};

async fn test_server() -> (TestServer, AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("api.db");
    let db = setup_database(&get_database_url(Some(&db_path.to_string_lossy())))
        .await
        .unwrap();
    let config = EngineConfig {
        environment: "api-test".to_string(),
        archive_dir: dir.path().join("archives"),
        checkpoint_dir: dir.path().join("checkpoints"),
        media_root: dir.path().join("media"),
        ..EngineConfig::default()
    };
    config.ensure_dirs().unwrap();
    let state = AppState::new(db, config);
    let server = TestServer::new(create_app(state.clone())).unwrap();
    (server, state, dir)
}

async fn mint(state: &AppState, permission: TokenPermission) -> String {
    let issued = state
        .tokens
        .issue(IssueTokenRequest {
            description: format!("test {} token", permission),
            permission: Some(permission),
            ..IssueTokenRequest::default()
        })
        .await
        .unwrap();
    format!("MigrationToken {}", issued.token)
}

fn auth(request: axum_test::TestRequest, header: &str) -> axum_test::TestRequest {
    request.add_header(
        axum::http::header::AUTHORIZATION,
        header.parse::<axum::http::HeaderValue>().unwrap(),
    )
}

#[tokio::test]
async fn health_is_open_and_reports_healthy() {
    let (server, _state, _dir) = test_server().await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["environment"], "api-test");
}

#[tokio::test]
async fn migration_routes_require_a_token() {
    let (server, _state, _dir) = test_server().await;
    let response = server.get("/api/v1/migration/jobs").await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn bearer_scheme_is_not_accepted() {
    let (server, state, _dir) = test_server().await;
    let raw = mint(&state, TokenPermission::Read)
        .await
        .replace("MigrationToken", "Bearer");
    let response = auth(server.get("/api/v1/migration/jobs"), &raw).await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn read_token_reads_jobs_but_cannot_push() {
    let (server, state, _dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;

    let response = auth(server.get("/api/v1/migration/jobs"), &read).await;
    response.assert_status_ok();
    let jobs: Vec<Value> = response.json();
    assert!(jobs.is_empty());

    let response = auth(server.post("/api/v1/migration/receive-import"), &read).await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn write_token_cannot_read() {
    let (server, state, _dir) = test_server().await;
    let write = mint(&state, TokenPermission::Write).await;
    let response = auth(server.get("/api/v1/migration/jobs"), &write).await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn token_management_is_admin_only() {
    let (server, state, _dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;
    let admin = mint(&state, TokenPermission::Admin).await;

    let response = auth(server.get("/api/v1/migration/tokens"), &read).await;
    response.assert_status_unauthorized();

    let response = auth(server.post("/api/v1/migration/tokens"), &admin)
        .json(&json!({
            "description": "push from ci",
            "permission": "write",
            "single_use": true
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let created: Value = response.json();
    let raw = created["token"].as_str().unwrap();
    assert!(raw.starts_with("mgt_"));

    // Listing exposes hashes and metadata, never the raw value.
    let response = auth(server.get("/api/v1/migration/tokens"), &admin).await;
    response.assert_status_ok();
    let listing = response.text();
    assert!(!listing.contains(raw));

    let token_id = created["id"].as_str().unwrap();
    let response = auth(
        server.delete(&format!("/api/v1/migration/tokens/{}", token_id)),
        &admin,
    )
    .await;
    response.assert_status_ok();

    let revoked = auth(server.get("/api/v1/migration/jobs"), &format!("MigrationToken {}", raw)).await;
    revoked.assert_status_unauthorized();
}

#[tokio::test]
async fn paused_gate_answers_503_on_mutations() {
    let (server, state, _dir) = test_server().await;
    let write = mint(&state, TokenPermission::Write).await;

    state.gate.pause();
    let response = auth(server.post("/api/v1/migration/receive-import"), &write).await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    // Reads stay up through the restore window.
    let read = mint(&state, TokenPermission::Read).await;
    let response = auth(server.get("/api/v1/migration/jobs"), &read).await;
    response.assert_status_ok();
    state.gate.resume();
}

#[tokio::test]
async fn verify_reports_clean_on_an_empty_database() {
    let (server, state, _dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;
    let response = auth(server.post("/api/v1/migration/verify"), &read).await;
    response.assert_status_ok();
    let report: Value = response.json();
    assert!(report["orphans"].as_array().unwrap().is_empty());
    assert_eq!(report["counts"]["users"], 0);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let (server, state, _dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;
    let response = auth(server.get("/api/v1/migration/jobs/nope"), &read).await;
    response.assert_status_not_found();
    let body: Value = response.json();
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn download_export_honors_byte_ranges() {
    let (server, state, dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;

    let job = state.registry.create(JobKind::Export, None).await.unwrap();
    let archive = dir.path().join("archives").join("small.tar.gz");
    std::fs::write(&archive, b"0123456789").unwrap();
    state
        .registry
        .set_archive(&job.id, &archive.to_string_lossy(), 10)
        .await
        .unwrap();
    let url = format!("/api/v1/migration/download-export/{}", job.id);

    let response = auth(server.get(&url), &read).await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), b"0123456789");

    let response = auth(
        server.get(&url).add_header(
            axum::http::header::RANGE,
            axum::http::HeaderValue::from_static("bytes=2-5"),
        ),
        &read,
    )
    .await;
    assert_eq!(response.status_code(), 206);
    assert_eq!(response.as_bytes().as_ref(), b"2345");
    assert_eq!(
        response
            .headers()
            .get(axum::http::header::CONTENT_RANGE)
            .unwrap(),
        "bytes 2-5/10"
    );
}

#[tokio::test]
async fn download_file_refuses_path_traversal() {
    let (server, state, _dir) = test_server().await;
    let read = mint(&state, TokenPermission::Read).await;
    let response = auth(
        server
            .get("/api/v1/migration/download-file")
            .add_query_param("path", "../../etc/passwd"),
        &read,
    )
    .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["code"], "VALIDATION_ERROR");
}
