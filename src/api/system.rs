use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::Result;
use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/gpu", get(gpu_inventory))
        .route("/gpu/available", get(gpu_available))
        .route("/gpu/stats", get(gpu_stats))
        .route("/refresh-gpu", post(refresh_gpu))
        .with_state(state)
}

/// GET /api/system/gpu — cached topology.
async fn gpu_inventory(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gpus = state.gpus.devices().await;
    Json(serde_json::json!({
        "cpuOnly": gpus.is_empty(),
        "gpus": gpus,
    }))
}

/// GET /api/system/gpu/available — quick capability probe.
async fn gpu_available(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gpus = state.gpus.devices().await;
    Json(serde_json::json!({
        "available": !gpus.is_empty(),
        "count": gpus.len(),
    }))
}

/// GET /api/system/gpu/stats — topology joined with the derived
/// running-instances-per-GPU view.
async fn gpu_stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let gpus = state.gpus.devices().await;
    let counts = state.store.gpu_running_counts().await?;

    let stats: Vec<serde_json::Value> = gpus
        .iter()
        .map(|gpu| {
            let running = counts.get(&gpu.index.to_string()).copied().unwrap_or(0);
            serde_json::json!({
                "index": gpu.index,
                "name": gpu.name,
                "totalMb": gpu.total_mb,
                "usedMb": gpu.used_mb,
                "freeMb": gpu.free_mb,
                "utilizationPercent": gpu.utilization_percent,
                "runningInstances": running,
            })
        })
        .collect();

    // Instances pinned to "auto" span every device; report them separately.
    let auto_instances = counts.get(crate::gpu::GPU_AUTO).copied().unwrap_or(0);

    Ok(Json(serde_json::json!({
        "gpus": stats,
        "autoInstances": auto_instances,
    })))
}

/// POST /api/system/refresh-gpu — force rediscovery.
async fn refresh_gpu(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let gpus = state.gpus.refresh().await;
    Json(serde_json::json!({
        "cpuOnly": gpus.is_empty(),
        "gpus": gpus,
    }))
}
