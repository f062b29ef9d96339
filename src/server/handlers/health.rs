use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::server::app::AppState;

/// Unauthenticated liveness probe. Reports whether the service gate is
/// currently paused for a restore.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": if state.gate.is_paused() { "restoring" } else { "healthy" },
        "service": "gangway",
        "environment": state.config.environment,
        "version": env!("CARGO_PKG_VERSION")
    }))
}
