use axum::routing::{delete, get, post};
use axum::Router;
use sea_orm::DatabaseConnection;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::EngineConfig;
use crate::jobs::{JobRegistry, ServiceGate, TargetLockMap};
use crate::services::token_service::TokenService;

use super::handlers::{export, files, health, imports, jobs, restore, tokens};

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: EngineConfig,
    pub registry: JobRegistry,
    pub tokens: TokenService,
    pub locks: TargetLockMap,
    pub gate: ServiceGate,
}

impl AppState {
    pub fn new(db: DatabaseConnection, config: EngineConfig) -> Self {
        let registry = JobRegistry::new(db.clone());
        let tokens = TokenService::new(db.clone(), config.token_default_ttl_hours);
        Self {
            db,
            config,
            registry,
            tokens,
            locks: TargetLockMap::new(),
            gate: ServiceGate::new(),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(export::start_export),
    info(title = "gangway migration API")
)]
struct ApiDoc;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1/migration", migration_routes())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

fn migration_routes() -> Router<AppState> {
    Router::new()
        // Export side
        .route("/export", post(export::start_export))
        .route("/export-status/:job_id", get(export::export_status))
        .route("/download-export/:job_id", get(export::download_export))
        // Import side
        .route("/receive-import", post(imports::receive_import))
        .route("/verify", post(imports::verify))
        .route("/rollback/:job_id", post(imports::rollback))
        // Media transfer
        .route("/media-list", get(files::media_list))
        .route("/download-file", get(files::download_file))
        .route("/receive-file", post(files::receive_file))
        // Job registry
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/logs", get(jobs::job_logs))
        .route("/jobs/:job_id/cancel", post(jobs::cancel_job))
        // Token authority
        .route("/tokens", post(tokens::create_token))
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/:token_id", delete(tokens::revoke_token))
        .route("/tokens/:token_id/audits", get(tokens::token_audits))
        // Disaster recovery
        .route("/backup/upload", post(restore::upload_backup))
        .route("/backup/restore/:job_id", post(restore::run_restore))
}
