pub mod containers;
pub mod ollama;
pub mod system;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/containers", containers::routes(state.clone()))
        .nest("/ollama", ollama::routes(state.clone()))
        .nest("/system", system::routes(state))
}

/// GET /api/health — liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now() }))
}
