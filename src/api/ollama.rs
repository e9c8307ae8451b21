use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::models::EngineKind;
use crate::error::Result;
use crate::gpu::GpuPreference;
use crate::manager::CreateOllamaRequest;
use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/with-orphan-check", get(list_with_orphan_check))
        .route("/{id}", get(get_one).delete(remove))
        .route("/{id}/start", post(start))
        .route("/{id}/stop", post(stop))
        .route("/{id}/restart", post(restart))
        .route("/{id}/logs", get(logs))
        .route("/{id}/models", get(list_models).post(pull_model))
        .route("/{id}/models/{name}", delete(delete_model))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OllamaBody {
    name: String,
    api_key: Option<String>,
    #[serde(default)]
    require_auth: bool,
    hostname: Option<String>,
    gpu_selection: Option<String>,
}

/// GET /api/ollama — list Ollama instances with live status.
async fn list(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let views = state.manager.list(EngineKind::Ollama).await?;
    Ok(Json(views))
}

/// GET /api/ollama/with-orphan-check — reconcile, then list.
async fn list_with_orphan_check(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let (instances, warning) = state.manager.list_with_reconcile(EngineKind::Ollama).await?;
    Ok(Json(serde_json::json!({
        "instances": instances,
        "warning": warning,
    })))
}

/// POST /api/ollama — create an Ollama instance, attaching to an existing
/// engine container when one is already on this host.
async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OllamaBody>,
) -> Result<impl IntoResponse> {
    let gpu_preference = match body.gpu_selection.as_deref() {
        Some(raw) => GpuPreference::parse(raw)?,
        None => GpuPreference::Auto,
    };
    let view = state
        .manager
        .create_ollama(CreateOllamaRequest {
            name: body.name,
            api_key: body.api_key,
            require_auth: body.require_auth,
            hostname: body.hostname,
            gpu_preference,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/ollama/:id — the instance plus its model records.
async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.get(EngineKind::Ollama, &id).await?;
    let models = state.store.list_models(&id).await?;

    let mut body = serde_json::to_value(&view).unwrap_or_default();
    body["models"] = serde_json::json!(models);
    Ok(Json(body))
}

/// DELETE /api/ollama/:id
async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.manager.remove(EngineKind::Ollama, &id).await?;
    Ok(Json(serde_json::json!({ "status": "removed" })))
}

/// POST /api/ollama/:id/start
async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.start(EngineKind::Ollama, &id).await?;
    Ok(Json(view))
}

/// POST /api/ollama/:id/stop
async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.stop(EngineKind::Ollama, &id).await?;
    Ok(Json(view))
}

/// POST /api/ollama/:id/restart
async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let view = state.manager.restart(EngineKind::Ollama, &id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

/// GET /api/ollama/:id/logs?tail=N
async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    let output = state
        .manager
        .logs(EngineKind::Ollama, &id, query.tail.unwrap_or(100))
        .await?;
    Ok(output)
}

/// GET /api/ollama/:id/models — model records for the instance.
async fn list_models(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // Surface a clean 404 for unknown instances rather than an empty list.
    state.store.get_instance(EngineKind::Ollama, &id).await?;
    let models = state.store.list_models(&id).await?;
    Ok(Json(models))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullBody {
    model_name: String,
}

/// POST /api/ollama/:id/models — pull a model, streaming progress as SSE.
/// Each event's data line is one JSON progress record; the stream closes on
/// completion or error. The pull itself survives subscriber disconnects.
async fn pull_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PullBody>,
) -> Result<impl IntoResponse> {
    let record = state.store.get_instance(EngineKind::Ollama, &id).await?;
    let receiver = state.puller.pull(&record, &body.model_name).await?;

    let stream = ReceiverStream::new(receiver).map(|progress| {
        Ok::<Event, Infallible>(
            Event::default().data(serde_json::to_string(&progress).unwrap_or_default()),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// DELETE /api/ollama/:id/models/:name — delete from the engine, then drop
/// the record.
async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let record = state.store.get_instance(EngineKind::Ollama, &id).await?;
    state.puller.delete_model(&record, &name).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}
