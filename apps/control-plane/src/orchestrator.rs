//! Orchestrator HTTP admin surface (§4.H): `list-workers [class]`, `scale
//! <class> <n>`, `drain <worker_id>`, `reprocess-deadletter <queue>`,
//! exposed as `GET /workers[/{class}]`, `POST /scale/{class}`, `POST
//! /drain/{worker_id}`, and a `/deadletter/{class}` admin router nested
//! from [`broker::dlq_admin_router`]. Thin wrappers over the scaling
//! backend (component E) and the broker's [`DlqManager`], per §4.H.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use broker::store::StoreClient;
use broker::{dlq_admin_router, DlqAdminState, DlqManager};
use scaling::{ScalingBackend, WorkerClassConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Shared state for every orchestrator admin route.
#[derive(Clone)]
pub struct OrchestratorState {
    pub store: Arc<dyn StoreClient>,
    pub backend: Arc<dyn ScalingBackend>,
    /// Configured classes, keyed by class name, for deriving each class's
    /// queue stream/dead-letter stream and replica bounds.
    pub class_configs: HashMap<String, WorkerClassConfig>,
}

/// How far back into `worker:status` the directory scans looking for one
/// recent entry per worker id. Same scan style as
/// [`scaling::ScalingService`]'s busy-heartbeat check.
const WORKER_DIRECTORY_LOOKBACK: usize = 1000;

/// One worker's latest known status, as surfaced by `GET /workers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub class: String,
    pub state: String,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub uptime_seconds: u64,
    pub updated_at: String,
    /// Whether `worker:heartbeat:<id>` is still present (not expired past
    /// its 3×interval TTL). A worker with no live heartbeat but a recent
    /// `worker:status` entry has likely crashed since its last beat.
    pub alive: bool,
}

/// Scans the tail of `worker:status` for the most recent entry per
/// worker id, optionally filtered to one class, then checks each
/// worker's heartbeat hash for liveness.
pub async fn list_workers(
    store: &dyn StoreClient,
    class: Option<&str>,
) -> broker::error::BrokerResult<Vec<WorkerSummary>> {
    let entries = store
        .revrange("worker:status", "-", "+", WORKER_DIRECTORY_LOOKBACK)
        .await?;

    let mut seen = std::collections::HashSet::new();
    let mut summaries = Vec::new();

    for (_, fields) in entries {
        let Some(worker_id) = fields.get("worker_id") else {
            continue;
        };
        if !seen.insert(worker_id.clone()) {
            continue;
        }
        let entry_class = fields.get("class").cloned().unwrap_or_default();
        if let Some(class) = class {
            if entry_class != class {
                continue;
            }
        }

        let heartbeat_key = format!("worker:heartbeat:{worker_id}");
        let alive = !store.hgetall(&heartbeat_key).await?.is_empty();

        summaries.push(WorkerSummary {
            worker_id: worker_id.clone(),
            class: entry_class,
            state: fields.get("state").cloned().unwrap_or_default(),
            jobs_processed: fields.get("jobs_processed").and_then(|v| v.parse().ok()).unwrap_or(0),
            jobs_failed: fields.get("jobs_failed").and_then(|v| v.parse().ok()).unwrap_or(0),
            uptime_seconds: fields.get("uptime_seconds").and_then(|v| v.parse().ok()).unwrap_or(0),
            updated_at: fields.get("updated_at").cloned().unwrap_or_default(),
            alive,
        });
    }

    Ok(summaries)
}

/// `GET /workers`: every class's workers.
async fn list_all_workers_handler(
    State(state): State<OrchestratorState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workers = list_workers(state.store.as_ref(), None)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))?;
    Ok(Json(json!({"count": workers.len(), "workers": workers})))
}

/// `GET /workers/{class}`: one class's workers.
async fn list_class_workers_handler(
    State(state): State<OrchestratorState>,
    Path(class): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workers = list_workers(state.store.as_ref(), Some(&class))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))?;
    Ok(Json(json!({"class": class, "count": workers.len(), "workers": workers})))
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: u32,
}

/// `POST /scale/{class}`: directly drives the configured backend to
/// `replicas`, bypassing the scaling service's thresholds and cooldown —
/// an explicit operator override, same as the orchestrator CLI's `scale
/// <class> <n>` (§4.H). Bounds (`max_replicas`) are still enforced by the
/// backend itself.
async fn scale_handler(
    State(state): State<OrchestratorState>,
    Path(class): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    info!(class = %class, target = req.replicas, "orchestrator API scale request");
    match state.backend.scale(&class, req.replicas).await {
        Ok(observed) => Ok(Json(json!({"class": class, "target": req.replicas, "observed": observed}))),
        Err(e) => {
            warn!(class = %class, error = %e, "orchestrator API scale request failed");
            Err((StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()}))))
        }
    }
}

/// `POST /drain/{worker_id}`: sets the `worker:drain:<id>` marker the
/// worker runtime's consume loop polls every iteration (§4.H), so the
/// worker finishes its current job and exits on its own rather than being
/// killed out from under an in-flight delivery.
async fn drain_handler(
    State(state): State<OrchestratorState>,
    Path(worker_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let key = format!("worker:drain:{worker_id}");
    state
        .store
        .set(&key, "requested")
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))?;
    info!(worker_id = %worker_id, "orchestrator API drain requested");
    Ok(Json(json!({"worker_id": worker_id, "drain": "requested"})))
}

#[derive(Debug, Deserialize)]
struct ReprocessAllParams {
    #[serde(default)]
    reset_retry_count: bool,
}

/// `POST /deadletter/{class}/reprocess`: republishes every entry in the
/// class's dead-letter stream back onto its live queue. Backs the
/// orchestrator CLI's `reprocess-deadletter <queue>` (§4.H), which
/// reprocesses a whole queue rather than one entry — contrast with
/// [`broker::dlq_admin_router`]'s nested `/{id}/reprocess`, which targets
/// a single entry.
async fn reprocess_all_handler(
    State(state): State<OrchestratorState>,
    Path(class): Path<String>,
    Query(params): Query<ReprocessAllParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(config) = state.class_configs.get(&class) else {
        return Err((StatusCode::NOT_FOUND, Json(json!({"error": "unknown class", "class": class}))));
    };
    let manager = DlqManager::new(state.store.clone(), format!("{class}:dead"));
    let requeued = manager
        .reprocess_all(&config.queue_stream, params.reset_retry_count)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))?;
    info!(class = %class, requeued, "orchestrator API reprocessed dead-letter queue");
    Ok(Json(json!({"class": class, "requeued": requeued})))
}

/// `GET /health`: liveness for the control-plane process itself (as
/// distinct from any worker's `/health`).
async fn control_plane_health_handler(State(state): State<OrchestratorState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok", "store": "ok"})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "store": e.to_string()})),
        )
            .into_response(),
    }
}

/// `GET /metrics`: Prometheus text format, same exporter the worker
/// binary exposes (scaling-specific gauges are registered under
/// `scaling::metrics::names`).
async fn control_plane_metrics_handler() -> impl IntoResponse {
    match broker::metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

/// Builds the full orchestrator admin router: `/health`, `/metrics`,
/// `/workers[/{class}]`, `/scale/{class}`, `/drain/{worker_id}`, and one
/// `/deadletter/{class}` dead-letter admin router per configured class.
pub fn orchestrator_router(state: OrchestratorState) -> Router {
    let mut router = Router::new()
        .route("/health", get(control_plane_health_handler))
        .route("/healthz", get(control_plane_health_handler))
        .route("/metrics", get(control_plane_metrics_handler))
        .route("/workers", get(list_all_workers_handler))
        .route("/workers/{class}", get(list_class_workers_handler))
        .route("/scale/{class}", post(scale_handler))
        .route("/drain/{worker_id}", post(drain_handler))
        .route("/deadletter/{class}/reprocess", post(reprocess_all_handler))
        .with_state(state.clone());

    for (class, config) in &state.class_configs {
        let dlq_state = DlqAdminState {
            manager: DlqManager::new(state.store.clone(), format!("{class}:dead")),
            target_stream: config.queue_stream.clone(),
        };
        router = router.nest(&format!("/deadletter/{class}"), dlq_admin_router(dlq_state));
    }

    router
}
