use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::db::models::{EngineKind, VllmConfig};
use crate::error::Result;
use crate::gpu::GpuPreference;
use crate::manager::CreateVllmRequest;
use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/with-orphan-check", get(list_with_orphan_check))
        .route("/orphans", get(orphans))
        .route("/orphans/import", post(import_orphans))
        .route("/{id}", get(get_one).put(update).delete(remove))
        .route("/{id}/start", post(start))
        .route("/{id}/stop", post(stop))
        .route("/{id}/restart", post(restart))
        .route("/{id}/logs", get(logs))
        .with_state(state)
}

/// Wire shape shared by create and replace.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBody {
    name: String,
    model_name: String,
    api_key: Option<String>,
    #[serde(default)]
    require_auth: bool,
    hostname: Option<String>,
    gpu_selection: Option<String>,
    max_context_length: Option<u32>,
    gpu_memory_utilization: Option<f64>,
    max_num_seqs: Option<u32>,
    trust_remote_code: Option<bool>,
    quantization: Option<String>,
    tensor_parallel_size: Option<u32>,
}

impl ContainerBody {
    fn into_request(self) -> Result<CreateVllmRequest> {
        let gpu_preference = match self.gpu_selection.as_deref() {
            Some(raw) => GpuPreference::parse(raw)?,
            None => GpuPreference::Auto,
        };
        let defaults = VllmConfig::default();
        Ok(CreateVllmRequest {
            name: self.name,
            model_ref: self.model_name,
            api_key: self.api_key,
            require_auth: self.require_auth,
            hostname: self.hostname,
            gpu_preference,
            config: VllmConfig {
                gpu_memory_utilization: self
                    .gpu_memory_utilization
                    .unwrap_or(defaults.gpu_memory_utilization),
                max_num_seqs: self.max_num_seqs.unwrap_or(defaults.max_num_seqs),
                max_context_length: self.max_context_length,
                trust_remote_code: self.trust_remote_code.unwrap_or(false),
                quantization: self.quantization,
                tensor_parallel_size: self.tensor_parallel_size,
                hostname: None,
                imported: None,
            },
        })
    }
}

/// GET /api/containers — list vLLM instances with live status.
async fn list(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let views = state.manager.list(EngineKind::Vllm).await?;
    Ok(Json(views))
}

/// GET /api/containers/with-orphan-check — reconcile, then list. A
/// reconciliation problem surfaces as a warning, never as a failed read.
async fn list_with_orphan_check(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let (instances, warning) = state.manager.list_with_reconcile(EngineKind::Vllm).await?;
    Ok(Json(serde_json::json!({
        "instances": instances,
        "warning": warning,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrphanQuery {
    #[serde(default)]
    auto_import: bool,
}

/// GET /api/containers/orphans?autoImport=bool — detect, optionally import.
async fn orphans(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrphanQuery>,
) -> Result<impl IntoResponse> {
    let report = state.manager.reconcile(query.auto_import).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody {
    container_ids: Vec<String>,
}

/// POST /api/containers/orphans/import — import a named subset.
async fn import_orphans(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportBody>,
) -> Result<impl IntoResponse> {
    let report = state.manager.import_orphans(&body.container_ids).await?;
    Ok(Json(report))
}

/// POST /api/containers — create a vLLM instance.
async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContainerBody>,
) -> Result<impl IntoResponse> {
    let view = state.manager.create_vllm(body.into_request()?).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// PUT /api/containers/:id — replace the configuration.
async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ContainerBody>,
) -> Result<impl IntoResponse> {
    let view = state.manager.update_vllm(&id, body.into_request()?).await?;
    Ok(Json(view))
}

/// GET /api/containers/:id — one instance with live status.
async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.get(EngineKind::Vllm, &id).await?;
    Ok(Json(view))
}

/// DELETE /api/containers/:id — remove the instance and free its port.
async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.manager.remove(EngineKind::Vllm, &id).await?;
    Ok(Json(serde_json::json!({ "status": "removed" })))
}

/// POST /api/containers/:id/start
async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.start(EngineKind::Vllm, &id).await?;
    Ok(Json(view))
}

/// POST /api/containers/:id/stop
async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.stop(EngineKind::Vllm, &id).await?;
    Ok(Json(view))
}

/// POST /api/containers/:id/restart
async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.restart(EngineKind::Vllm, &id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

/// GET /api/containers/:id/logs?tail=N — both streams as text.
async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    let output = state
        .manager
        .logs(EngineKind::Vllm, &id, query.tail.unwrap_or(100))
        .await?;
    Ok(output)
}
